#![deny(unsafe_code)]

use std::process;

use structopt::StructOpt;

use mqlink::logger::logger_init;
use mqlink_conf::{Options, Settings};

mod bench;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("mqlink-bench failed: {:?}", e);
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    //init config
    let settings = Settings::init(Options::from_args())?;

    //init log
    logger_init(&settings.log)?;

    Settings::logs()?;

    bench::run(settings).await
}
