mod chain;
mod command;
mod ebpf;
mod logging;
mod monitor;
mod shutdown;
mod system;
mod utils;
use clap::Parser;
use command::{run, Options};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), anyhow::Error> {
    // Parse command line arguments
    let options = Options::parse();

    // Run main program
    run(options).await?;

    Ok(())
}
