//! tmclient
//!
//! Themisto Client

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;

use tmkernel::error::ClientError;
use tmkernel::kernel_connection::{ConnectOptions, KernelConnection};
use tmkernel::rest::{self, ServerSettings};
use tmshared::requests::ExecuteRequest;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The base URL of the Jupyter server
    #[arg(short, long, value_name = "URL")]
    url: Option<String>,

    /// Authentication token, if the server requires one
    #[arg(short, long, value_name = "TOKEN")]
    token: Option<String>,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the installed kernel specs
    Specs,

    /// List the running kernels
    Kernels,

    /// List the active sessions
    Sessions,

    /// Run a snippet of code on a fresh kernel and print its output
    Run {
        /// The code to execute
        code: String,

        /// The kernel spec to start; defaults to the server's default
        #[arg(short, long, value_name = "NAME")]
        kernel: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let base_url = match args.url {
        Some(url) => url,
        None => String::from("http://localhost:8888"),
    };

    let mut settings = ServerSettings::new(&base_url).context("invalid server URL")?;
    if let Some(token) = args.token {
        settings = settings.with_token(token);
    }

    match args.command {
        Some(Commands::Specs) => {
            let specs = rest::list_kernel_specs(&settings).await?;
            println!("{}", serde_json::to_string_pretty(&specs)?);
        }
        Some(Commands::Kernels) => {
            let kernels = rest::list_running_kernels(&settings).await?;
            println!("{}", serde_json::to_string_pretty(&kernels)?);
        }
        Some(Commands::Sessions) => {
            let sessions = rest::list_running_sessions(&settings).await?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        Some(Commands::Run { code, kernel }) => {
            run_snippet(settings, code, kernel).await?;
        }
        None => {
            eprintln!("No command specified");
        }
    }

    Ok(())
}

/// Start a kernel, execute one snippet, print what comes back on iopub, and
/// shut the kernel down again.
async fn run_snippet(
    settings: ServerSettings,
    code: String,
    kernel_name: Option<String>,
) -> anyhow::Result<()> {
    let name = match kernel_name {
        Some(name) => name,
        None => rest::list_kernel_specs(&settings).await?.default,
    };

    info!("Starting new '{}' kernel", name);
    let kernel =
        KernelConnection::start_new(settings, &name, ConnectOptions::default()).await?;

    let future = kernel.execute(ExecuteRequest::new(code))?;
    let iopub = future.iopub();

    while let Ok(msg) = iopub.recv().await {
        match msg.header.msg_type.as_str() {
            "stream" => {
                if let Some(text) = msg.content.get("text").and_then(|value| value.as_str()) {
                    print!("{}", text);
                }
            }
            "execute_result" | "display_data" => {
                if let Some(text) = msg
                    .content
                    .get("data")
                    .and_then(|data| data.get("text/plain"))
                    .and_then(|value| value.as_str())
                {
                    println!("{}", text);
                }
            }
            "error" => {
                let ename = msg.content.get("ename").and_then(|value| value.as_str());
                let evalue = msg.content.get("evalue").and_then(|value| value.as_str());
                eprintln!(
                    "{}: {}",
                    ename.unwrap_or("error"),
                    evalue.unwrap_or("execution failed")
                );
            }
            _ => {}
        }
    }

    match future.reply().await {
        Ok(reply) => {
            info!(
                "Execution finished with status {:?}",
                reply.content.get("status")
            );
        }
        Err(ClientError::KernelTerminated) => {
            // The future was disposed at completion; nothing left to report
        }
        Err(err) => return Err(err.into()),
    }

    kernel.shutdown().await?;
    Ok(())
}
