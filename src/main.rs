//! Command line capture of a static HTML file

use anyhow::{anyhow, bail, Context as _};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::Parser;
use domsnap::platform::static_page::StaticPage;
use domsnap::{CaptureConfig, OutputType};
use log::info;
use percent_encoding::percent_decode_str;
use std::fs;
use std::path::PathBuf;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "domsnap", version, about = "Capture an element of an HTML file as an image")]
struct Cli {
    /// HTML file to load
    #[arg(value_name = "HTML_FILE")]
    html_file: PathBuf,

    /// CSS selector of the element to capture
    #[arg(long, default_value = "body")]
    selector: String,

    /// Output format: png, jpeg, webp or svg
    #[arg(long)]
    format: Option<OutputType>,

    /// Device pixel ratio
    #[arg(long)]
    scale: Option<f64>,

    /// Encoder quality for lossy formats (0 to 1)
    #[arg(long)]
    quality: Option<f64>,

    /// Output width in CSS pixels
    #[arg(long)]
    width: Option<f64>,

    /// Output height in CSS pixels
    #[arg(long)]
    height: Option<f64>,

    /// Canvas background color
    #[arg(long, value_name = "COLOR")]
    background: Option<String>,

    /// JSON file with capture options
    #[arg(long, value_name = "JSON_FILE")]
    config: Option<PathBuf>,

    /// Where to write the image; prints the data URL when omitted
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,
}

impl Cli {
    fn capture_config(&self) -> anyhow::Result<CaptureConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str::<CaptureConfig>(&text)
                    .with_context(|| format!("invalid config in {}", path.display()))?
            }
            None => CaptureConfig::default(),
        };
        if let Some(format) = self.format {
            config.output = format;
        }
        if let Some(scale) = self.scale {
            config.scale = scale;
        }
        if let Some(quality) = self.quality {
            config.quality = quality;
        }
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(background) = &self.background {
            config.background_color = Some(background.clone());
        }
        Ok(config)
    }
}

/// Bytes to write for a data URL produced by the capture
fn data_url_bytes(data_url: &str) -> anyhow::Result<Vec<u8>> {
    let (header, body) = data_url
        .split_once(',')
        .ok_or_else(|| anyhow!("malformed data URL"))?;
    if header.ends_with(";base64") {
        Ok(STANDARD.decode(body)?)
    } else {
        Ok(percent_decode_str(body).collect())
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let path = fs::canonicalize(&cli.html_file)
        .with_context(|| format!("cannot open {}", cli.html_file.display()))?;
    let html = fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let base = Url::from_file_path(&path).map_err(|_| anyhow!("cannot build a file URL for {}", path.display()))?;
    let config = cli.capture_config()?;

    let mut page = StaticPage::parse(&html, Some(base.as_str()));
    page.load_stylesheets().await;
    let Some(node) = page.select(&cli.selector) else {
        bail!("no element matches '{}'", cli.selector);
    };

    let data_url = domsnap::dom_to_data_url(&page, &node, config).await?;
    match &cli.out {
        Some(out) => {
            let bytes = data_url_bytes(&data_url)?;
            fs::write(out, &bytes).with_context(|| format!("failed to write {}", out.display()))?;
            info!("wrote {} bytes to {}", bytes.len(), out.display());
        }
        None => println!("{}", data_url),
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "warn")).init();
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("domsnap: {:#}", e);
        std::process::exit(1);
    }
}
