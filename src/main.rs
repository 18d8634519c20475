use anyhow::Result;

use surface_crawler::cli;
use surface_crawler::utils::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    init_logging(args.verbose, args.log_file.clone())?;

    cli::process_command(args).await
}
