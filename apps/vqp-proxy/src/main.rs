use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = vqp_proxy::Args::parse();

	vqp_proxy::run(args).await
}
