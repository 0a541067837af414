pub mod audit;
pub mod config;
pub mod daemon_lock;
pub mod history;
pub mod monitor;
pub mod notify;
pub mod paths;
pub mod push;
pub mod state;
pub mod updates;
pub mod upstream;
pub mod util;
pub mod warn;
