use std::{str::FromStr, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use iori_abr::{
    drm::{ClearKeyDecrypter, Decrypter},
    http::ReqwestTransport,
    params::{ParamDict, VariantValue},
    session::PlayerSession,
    time::TimeValue,
};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, ClientBuilder,
};

mod player;
mod summary;

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
struct DashPlayArgs {
    /// Stop after this many seconds of wallclock time
    #[clap(short, long, default_value = "30")]
    duration: u64,

    /// Start position in seconds. Live presentations start at the live edge.
    #[clap(short, long)]
    start: Option<f64>,

    /// Bandwidth assumed before the first download, in bits per second
    #[clap(long, env = "DASHPLAY_INITIAL_BANDWIDTH")]
    initial_bandwidth: Option<u64>,

    /// Never select representations above this bandwidth
    #[clap(long)]
    max_bandwidth: Option<u64>,

    /// Never select video representations above this resolution, e.g. 1280x720
    #[clap(long)]
    max_resolution: Option<String>,

    /// Preferred audio and subtitle language
    #[clap(long)]
    language: Option<String>,

    /// Clear keys as `<kid>:<key>` hex pairs separated by `;`
    #[clap(long, env = "DASHPLAY_KEYS", hide_env_values = true)]
    keys: Option<String>,

    /// HTTP header sent with every request, e.g. "Referer: https://example.com"
    #[clap(short = 'H', long)]
    headers: Vec<String>,

    /// Extra player option as `key=value`, e.g. `abr.low_watermark=4`
    #[clap(short = 'o', long = "option")]
    options: Vec<String>,

    /// Debug output
    #[clap(long, alias = "debug")]
    verbose: bool,

    /// MPD URL
    url: String,
}

impl DashPlayArgs {
    fn client(&self) -> anyhow::Result<Client> {
        let mut headers = HeaderMap::new();
        for header in &self.headers {
            let (key, value) = header
                .split_once(':')
                .with_context(|| format!("Invalid header: {header}"))?;
            headers.insert(
                HeaderName::from_str(key.trim())?,
                HeaderValue::from_str(value.trim())?,
            );
        }
        Ok(ClientBuilder::new().default_headers(headers).build()?)
    }

    fn options(&self) -> anyhow::Result<ParamDict> {
        let mut options = ParamDict::new();
        if let Some(bandwidth) = self.initial_bandwidth {
            options.set("abr.initial_bandwidth", bandwidth as i64);
        }
        if let Some(language) = &self.language {
            options.set("dash.preferred_language", language.as_str());
        }
        for option in &self.options {
            let Some((key, value)) = option.split_once('=') else {
                bail!("Invalid option, expected key=value: {option}");
            };
            options.set(key.trim(), parse_value(value.trim()));
        }
        Ok(options)
    }

    fn max_resolution(&self) -> anyhow::Result<Option<(u32, u32)>> {
        let Some(resolution) = &self.max_resolution else {
            return Ok(None);
        };
        let (width, height) = resolution
            .split_once('x')
            .with_context(|| format!("Invalid resolution: {resolution}"))?;
        Ok(Some((width.parse()?, height.parse()?)))
    }
}

fn parse_value(value: &str) -> VariantValue {
    if let Ok(value) = value.parse::<i64>() {
        return value.into();
    }
    if let Ok(value) = value.parse::<f64>() {
        return value.into();
    }
    if let Ok(value) = value.parse::<bool>() {
        return value.into();
    }
    value.into()
}

fn main() -> anyhow::Result<()> {
    let args = DashPlayArgs::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .try_from_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let transport = ReqwestTransport::with_own_runtime(args.client()?)?;
    let decrypter = match &args.keys {
        Some(keys) => Some(Arc::new(keys.parse::<ClearKeyDecrypter>()?) as Arc<dyn Decrypter>),
        None => None,
    };
    let (session, channels) = PlayerSession::new(args.options()?, Arc::new(transport), decrypter);

    let config = player::PlayerConfig {
        url: args.url.clone(),
        start: args.start.map(TimeValue::from_seconds),
        run_for: Duration::from_secs(args.duration),
        max_bandwidth: args.max_bandwidth,
        max_resolution: args.max_resolution()?,
    };
    let summary = player::Player::new(session, channels, config).run()?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
