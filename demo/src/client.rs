use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vaultshare_sdk::{Client, Error, KeyRing, TlsClient, crypto};

#[derive(Debug, Parser)]
#[command(name = "vaultshare")]
#[command(about = "Share signed files through encrypted workspaces", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(short, long, default_value = "127.0.0.1:7878", help = "Server address")]
    server: String,
    #[arg(
        short = 'n',
        long,
        default_value = "localhost",
        help = "TLS name the server certificate carries"
    )]
    server_name: String,
    #[arg(
        long,
        default_value = "server.crt",
        help = "Trusted root certificate (PEM)"
    )]
    root_ca: PathBuf,
    #[arg(
        short,
        long,
        default_value = ".",
        help = "Directory holding key material (<id>.key, <id>.pem)"
    )]
    keys: PathBuf,
    #[arg(short, long, help = "Your user id")]
    id: String,
    #[arg(long, help = "Your password (not needed for keygen)")]
    secret: Option<String>,
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Generate an RSA keypair for your id
    Keygen,
    #[command(arg_required_else_help = true)]
    CreateWorkspace { workspace: String },
    /// Give another user access to a workspace you own
    #[command(arg_required_else_help = true)]
    Grant { workspace: String, member: String },
    #[command(arg_required_else_help = true)]
    Upload {
        workspace: String,
        file: PathBuf,
        #[arg(long, help = "Encrypt with the workspace key before uploading")]
        encrypt: bool,
    },
    #[command(arg_required_else_help = true)]
    Download {
        workspace: String,
        name: String,
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
        #[arg(long, help = "Decrypt with the workspace key after verifying")]
        decrypt: bool,
    },
    /// List the workspaces you are a member of
    List,
    #[command(arg_required_else_help = true)]
    Files { workspace: String },
    #[command(arg_required_else_help = true)]
    Remove { workspace: String, name: String },
}

fn private_key_path(args: &Cli) -> PathBuf {
    args.keys.join(format!("{}.key", args.id))
}

async fn connect(args: &Cli) -> Result<TlsClient, Error> {
    let Some(secret) = &args.secret else {
        eprintln!("--secret is required for this command");
        std::process::exit(1);
    };

    let (client, created) = Client::connect(
        &args.server,
        &args.server_name,
        &args.root_ca,
        &args.id,
        secret,
    )
    .await?;
    if created {
        info!("created account '{}'", args.id);
    }

    Ok(client)
}

/// Fetch and unwrap the caller's workspace key.
async fn workspace_key<S>(
    client: &mut Client<S>,
    args: &Cli,
    workspace: &str,
) -> Result<(vaultshare_sdk::definitions::WorkspaceKey, vaultshare_sdk::definitions::KeySalt), Error>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let private = crypto::load_private_key(&private_key_path(args))?;
    let record = client.download_key(workspace).await?;
    Ok(crypto::unwrap_key(&record, &private)?)
}

async fn run(args: Cli) -> Result<(), Error> {
    match &args.command {
        Commands::Keygen => {
            let (private, public) = crypto::generate_keypair()?;
            std::fs::create_dir_all(&args.keys)?;
            crypto::save_private_key(&private, &private_key_path(&args))?;
            crypto::save_public_key(&public, &args.keys.join(format!("{}.pem", args.id)))?;
            info!("wrote keypair for '{}' under {}", args.id, args.keys.display());
        }
        Commands::CreateWorkspace { workspace } => {
            let private = crypto::load_private_key(&private_key_path(&args))?;
            let mut client = connect(&args).await?;
            client.create_workspace(workspace, &private).await?;
            info!("created workspace '{workspace}'");
        }
        Commands::Grant { workspace, member } => {
            let private = crypto::load_private_key(&private_key_path(&args))?;
            let member_key =
                crypto::load_public_key(&args.keys.join(format!("{member}.pem")))?;
            let mut client = connect(&args).await?;
            client
                .grant_access(workspace, member, &private, &member_key)
                .await?;
            info!("granted '{member}' access to '{workspace}'");
        }
        Commands::Upload {
            workspace,
            file,
            encrypt,
        } => {
            let private = crypto::load_private_key(&private_key_path(&args))?;
            let name = file
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or(Error::Protocol("file has no usable name"))?
                .to_string();
            let mut content = tokio::fs::read(file).await?;

            let mut client = connect(&args).await?;
            if *encrypt {
                let (key, salt) = workspace_key(&mut client, &args, workspace).await?;
                content = crypto::encrypt_content(&key, &salt, &content)?;
            }
            client
                .upload_file(workspace, &name, &content, &private)
                .await?;
            info!("uploaded '{name}' to '{workspace}'");
        }
        Commands::Download {
            workspace,
            name,
            out,
            decrypt,
        } => {
            let mut client = connect(&args).await?;
            let keyring = KeyRing::new(&args.keys);
            let signer = client.download_file(workspace, name, out, &keyring).await?;
            info!("downloaded '{name}', signed by '{signer}'");

            if *decrypt {
                let path = out.join(name);
                let (key, salt) = workspace_key(&mut client, &args, workspace).await?;
                let plaintext = crypto::decrypt_content(&key, &salt, &tokio::fs::read(&path).await?)?;
                tokio::fs::write(&path, plaintext).await?;
                info!("decrypted '{name}'");
            }
        }
        Commands::List => {
            let mut client = connect(&args).await?;
            for workspace in client.list_workspaces().await? {
                println!("{workspace}");
            }
        }
        Commands::Files { workspace } => {
            let mut client = connect(&args).await?;
            for file in client.list_files(workspace).await? {
                println!("{file}");
            }
        }
        Commands::Remove { workspace, name } => {
            let mut client = connect(&args).await?;
            client.remove_file(workspace, name).await?;
            info!("removed '{name}' from '{workspace}'");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let filter = if args.verbose {
        "vaultshare=trace,vaultshare_sdk=trace"
    } else {
        "vaultshare=info,vaultshare_sdk=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .init();

    if let Err(e) = run(args).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
