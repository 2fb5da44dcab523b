mod cli;

use tivoserve::{config, policy, probe, server, tools};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::time::Duration;

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "tivoserve=trace,tower_http=debug".to_string()
        } else {
            "tivoserve=debug,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Probe { file, json } => probe_file(&file, cli.config.as_deref(), json),
        Commands::CheckTools => check_tools(),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("tivoserve {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn start_server(
    host: String,
    port: u16,
    config_path: Option<&std::path::Path>,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;

    // Override host/port from CLI if specified
    config.server.host = host;
    config.server.port = port;

    tracing::info!("Starting tivoserve");
    tracing::info!(
        "Server will listen on {}:{}",
        config.server.host,
        config.server.port
    );

    if config.shares.is_empty() {
        tracing::warn!("No shares configured; nothing will be served");
    }
    for share in &config.shares {
        tracing::info!("Share '{}' -> {:?}", share.name, share.path);
    }

    server::start_server(config).await
}

fn probe_file(file: &std::path::Path, config_path: Option<&std::path::Path>, json: bool) -> Result<()> {
    if !file.exists() {
        anyhow::bail!("File does not exist: {:?}", file);
    }

    let config = config::load_config_or_default(config_path)?;
    let prober = probe::MediaProber::new(
        tools::resolve_tool("ffprobe", config.tools.ffprobe_path.as_deref()),
        Duration::from_secs(config.streaming.probe_timeout_secs),
    );

    let rt = tokio::runtime::Runtime::new()?;
    let descriptor = rt.block_on(prober.probe(file))?;
    let plan = policy::decide(&descriptor, &config.device);

    if json {
        let report = serde_json::json!({
            "descriptor": &*descriptor,
            "plan": &plan,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("File: {}", file.display());
    println!("Container: {}", descriptor.container);
    if let Some(duration) = descriptor.duration {
        let secs = duration.as_secs();
        println!(
            "Duration: {:02}:{:02}:{:02}",
            secs / 3600,
            (secs / 60) % 60,
            secs % 60
        );
    }
    if let Some(kbps) = descriptor.bit_rate_kbps {
        println!("Bitrate: {} kb/s", kbps);
    }

    println!("\nVideo Streams: {}", descriptor.video_streams.len());
    for (i, stream) in descriptor.video_streams.iter().enumerate() {
        print!("  [{}] {} {}x{}", i, stream.codec, stream.width, stream.height);
        if let Some(fps) = stream.frame_rate {
            print!(", {:.3} fps", fps);
        }
        println!();
    }

    println!("\nAudio Streams: {}", descriptor.audio_streams.len());
    for (i, stream) in descriptor.audio_streams.iter().enumerate() {
        print!("  [{}] {} {}ch", i, stream.codec, stream.channels);
        if let Some(kbps) = stream.bit_rate_kbps {
            print!(", {} kb/s", kbps);
        }
        println!();
    }

    match plan {
        policy::DeliveryPlan::Passthrough => {
            println!("\nDelivery: passthrough (device plays this natively)");
        }
        policy::DeliveryPlan::Transcode(params) => {
            println!("\nDelivery: transcode");
            println!("  Video: {} @ {} kb/s", params.video_codec, params.video_kbps);
            println!(
                "  Audio: {} @ {} kb/s, {} Hz",
                params.audio_codec, params.audio_kbps, params.audio_sample_rate
            );
            println!("  Scaling: {:?}", params.scaling);
        }
    }

    Ok(())
}

fn check_tools() -> Result<()> {
    println!("Checking external tools...\n");

    let tools = tools::check_tools();
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version);
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        println!("Some tools are missing. Transcoding and probing need ffmpeg and ffprobe.");
    }

    Ok(())
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!("  Shares: {}", config.shares.len());
            println!("  Max sessions: {}", config.streaming.max_sessions);
            println!(
                "  Device: {} / {} up to {}x{}",
                config.device.default_video_codec,
                config.device.default_audio_codec,
                config.device.max_width,
                config.device.max_height
            );
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Server: {}:{}", config.server.host, config.server.port);
        }
    }

    Ok(())
}
