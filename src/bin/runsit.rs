use clap::Parser as _;

fn main() -> anyhow::Result<()> {
    // Must run before flag parsing and before any runtime threads exist: in
    // helper mode this process applies the launch request and never returns.
    runsit::bootstrap::maybe_become_child();

    let args = runsit::cli::Args::parse();
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(runsit::cli::run(args))
}
