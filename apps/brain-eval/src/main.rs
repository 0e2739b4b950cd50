use clap::Parser;

use brain_eval::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = Args::parse();

	brain_eval::run(args).await
}
