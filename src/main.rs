mod cli;
mod commands;
mod env_loader;
mod error;
mod logging;
mod openclaw;
mod relay;

fn main() {
    env_loader::load_dotenv();
    logging::init_tracing();
    if let Err(err) = cli::run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
