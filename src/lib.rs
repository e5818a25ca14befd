pub mod bootstrap;
pub mod build_info;
pub mod cli;
pub mod logbuf;
pub mod tasks;
pub mod watcher;
pub mod web;
