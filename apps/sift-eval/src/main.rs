use clap::Parser;

use sift_eval::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	sift_eval::run(Args::parse()).await
}
