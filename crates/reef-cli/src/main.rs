use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reef_server::{DispatcherConfig, RequestBody, RequestDispatcher, RewriteRule, ServerRequest};
use reef_vm::{Runtime, RuntimeConfig};

#[derive(Parser)]
#[command(name = "reef")]
#[command(about = "Serve one request against a directory loaded into the virtual runtime.", long_about = None)]
struct Cli {
    /// Host directory loaded into the virtual document root.
    docroot: PathBuf,

    /// Request URL (absolute, or a path like /index.php).
    url: String,

    #[arg(long)]
    method: Option<String>,

    /// Extra request header, NAME:VALUE. Repeatable.
    #[arg(long = "header", value_name = "NAME:VALUE")]
    headers: Vec<String>,

    /// Raw request body.
    #[arg(long)]
    body: Option<String>,

    #[arg(long, default_value = "http://example.com")]
    base_url: String,

    #[arg(long, default_value = "/www")]
    document_root: String,

    #[arg(long, default_value = ".php")]
    script_ext: String,

    /// Rewrite rule, PATTERN=>REPLACEMENT. Repeatable, first match wins.
    #[arg(long = "rewrite", value_name = "PATTERN=>REPLACEMENT")]
    rewrites: Vec<String>,

    /// Rotate the interpreter instance after this many requests.
    #[arg(long, default_value_t = 0)]
    max_requests: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let runtime = std::sync::Arc::new(Runtime::with_echo_engine(RuntimeConfig {
        document_root: cli.document_root.clone(),
        max_requests: cli.max_requests,
    })?);

    load_directory(&runtime, &cli.docroot, &cli.document_root)?;

    let mut rewrite_rules = Vec::with_capacity(cli.rewrites.len());
    for raw in &cli.rewrites {
        let (pattern, replacement) = raw
            .split_once("=>")
            .with_context(|| format!("invalid rewrite rule {raw:?} (expected PATTERN=>REPLACEMENT)"))?;
        rewrite_rules.push(RewriteRule::new(pattern, replacement)?);
    }

    let dispatcher = RequestDispatcher::new(
        runtime,
        DispatcherConfig {
            document_root: cli.document_root.clone(),
            base_url: cli.base_url.clone(),
            script_ext: cli.script_ext.clone(),
            rewrite_rules,
        },
    )?;

    let mut request = ServerRequest::get(cli.url.clone());
    request.method = cli.method.clone();
    for raw in &cli.headers {
        let (name, value) = raw
            .split_once(':')
            .with_context(|| format!("invalid header {raw:?} (expected NAME:VALUE)"))?;
        request.headers.append(name.trim(), value.trim());
    }
    if let Some(body) = &cli.body {
        request.body = Some(RequestBody::Bytes(body.as_bytes().to_vec()));
    }

    let response = dispatcher.serve(request).await?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "HTTP {}", response.status)?;
    for (name, values) in &response.headers {
        for value in values {
            writeln!(stdout, "{name}: {value}")?;
        }
    }
    writeln!(stdout)?;
    stdout.write_all(&response.body)?;
    if !response.errors.is_empty() {
        eprintln!("{}", response.errors);
    }

    std::process::exit(if response.exit_code == 0 { 0 } else { 1 });
}

/// Copies a host directory tree into the runtime's virtual document root.
fn load_directory(runtime: &Runtime, host_dir: &std::path::Path, document_root: &str) -> Result<()> {
    for entry in walkdir::WalkDir::new(host_dir) {
        let entry = entry.with_context(|| format!("walk {}", host_dir.display()))?;
        let rel = entry
            .path()
            .strip_prefix(host_dir)
            .context("walked entry outside the root")?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let virt_path = format!(
            "{}/{}",
            document_root.trim_end_matches('/'),
            rel.to_string_lossy().replace('\\', "/")
        );
        if entry.file_type().is_dir() {
            runtime.mkdir_tree(&virt_path)?;
        } else if entry.file_type().is_file() {
            let data = std::fs::read(entry.path())
                .with_context(|| format!("read {}", entry.path().display()))?;
            runtime.write_file(&virt_path, data)?;
        }
    }
    Ok(())
}
