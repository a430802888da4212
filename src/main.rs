use anyhow::{Context, Error};
use clap::Parser;
use clap_stdin::MaybeStdin;
use mdoc_presentment::config::PresentmentConfig;
use mdoc_presentment::definitions::device_engagement::{self, DeviceEngagement};
use mdoc_presentment::definitions::helpers::Tag24;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log filter, overridden by RUST_LOG.
    #[arg(long, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, clap::Subcommand)]
enum Action {
    /// Print the ephemeral key and connection methods offered in a device engagement.
    DecodeEngagement {
        /// An `mdoc:` QR code URI, or the hex encoded DeviceEngagement.
        engagement: MaybeStdin<String>,
    },
    /// Print the default presentment settings as JSON.
    DefaultConfig,
}

fn main() -> Result<(), Error> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match args.action {
        Action::DecodeEngagement { engagement } => {
            println!("{}", describe_engagement(engagement.trim())?)
        }
        Action::DefaultConfig => println!(
            "{}",
            serde_json::to_string_pretty(&PresentmentConfig::default())?
        ),
    }
    Ok(())
}

fn parse_engagement(engagement: &str) -> Result<DeviceEngagement, Error> {
    if engagement.starts_with("mdoc:") {
        return Ok(Tag24::<DeviceEngagement>::from_qr_code_uri(engagement)?.into_inner());
    }
    let bytes = hex::decode(engagement).context("engagement is neither an mdoc: URI nor hex")?;
    device_engagement::decode(&bytes).context("could not parse device engagement")
}

fn describe_engagement(engagement: &str) -> Result<String, Error> {
    let engagement = parse_engagement(engagement)?;
    tracing::debug!(
        "device engagement version {}, {} connection methods",
        engagement.version,
        engagement.connection_methods.len()
    );
    let e_device_key = engagement.e_device_key().to_encoded_point(false);
    let description = serde_json::json!({
        "version": engagement.version,
        "eDeviceKey": hex::encode(e_device_key.as_bytes()),
        "connectionMethods": engagement.connection_methods,
    });
    Ok(serde_json::to_string_pretty(&description)?)
}
