/// Build metadata stamped by build.rs, for the admin UI footer.
pub fn banner() -> String {
    let build_time = option_env!("RUNSIT_BUILD_TIME").unwrap_or("unknown");
    let build_host = option_env!("RUNSIT_BUILD_HOST").unwrap_or("unknown");
    format!(
        "runsit {} (built {build_time} on {build_host})",
        env!("CARGO_PKG_VERSION")
    )
}
