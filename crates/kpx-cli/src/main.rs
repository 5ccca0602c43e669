//! kpx: talk to the KeePassXC browser proxy from the command line.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use kpx_client::{
    AssociationManager, ClientConfig, GetLoginsRequest, JsonFileStore, ProxyClient,
    SetLoginRequest, TestOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "kpx")]
#[command(about = "Client for the KeePassXC browser proxy")]
struct Args {
    /// Proxy socket or named pipe
    #[arg(long, global = true, env = "KPX_SOCKET_PATH")]
    socket: Option<PathBuf>,

    /// Association store file
    #[arg(long, global = true, env = "KPX_STORE_PATH")]
    store: Option<PathBuf>,

    /// Seconds to wait for replies that may need user interaction
    #[arg(long, global = true, env = "KPX_INTERACTIVE_TIMEOUT_SECS")]
    interactive_timeout: Option<u64>,

    /// Ask KeePassXC to show its unlock dialog when the database is locked
    /// (also enabled by KPX_TRIGGER_UNLOCK)
    #[arg(long, global = true)]
    unlock: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Associate with the open database (KeePassXC asks for confirmation)
    Associate,

    /// Check the stored association for the open database
    TestAssociate,

    /// Print the hash of the open database
    Hash,

    /// List logins for a url
    Logins {
        url: String,
        #[arg(long)]
        submit_url: Option<String>,
        /// Include entries restricted to HTTP basic auth
        #[arg(long)]
        http_auth: bool,
    },

    /// Create or update a login
    SetLogin {
        url: String,
        #[arg(long)]
        login: String,
        /// Password; read from KPX_PASSWORD when omitted
        #[arg(long, env = "KPX_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        group_uuid: Option<String>,
        /// Existing entry to update
        #[arg(long)]
        uuid: Option<String>,
    },

    /// Generate a password with KeePassXC's generator
    GeneratePassword,

    /// Lock the open database
    Lock,

    /// List database groups
    Groups,

    /// Create a group (`parent/child` paths allowed)
    CreateGroup { name: String },

    /// Print the current TOTP of an entry
    Totp { uuid: String },

    /// Delete an entry
    DeleteEntry { uuid: String },

    /// Run global auto-type for a url
    Autotype { url: String },

    /// List stored associations
    Associations,

    /// Print lock/unlock notifications until interrupted
    Watch,

    /// Show version information
    Version,
}

fn config_from(args: &Args) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env()?;
    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }
    if let Some(store) = &args.store {
        config.store_path = store.clone();
    }
    if let Some(secs) = args.interactive_timeout {
        config.interactive_timeout = Duration::from_secs(secs);
    }
    config.trigger_unlock |= args.unlock;
    config.validate()?;
    Ok(config)
}

fn print_value(json: bool, value: serde_json::Value, plain: impl FnOnce()) {
    if json {
        println!("{}", value);
    } else {
        plain();
    }
}

fn main() -> Result<()> {
    kpx_common::init_tracing_with_default("warn");

    let args = Args::parse();

    if let Command::Version = args.command {
        println!("kpx {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = config_from(&args)?;
    let store = JsonFileStore::new(config.store_path.clone());
    let associations = Arc::new(
        AssociationManager::open(Box::new(store))
            .with_context(|| format!("loading {}", config.store_path.display()))?,
    );

    if let Command::Associations = args.command {
        for record in associations.records() {
            let key = record.connection_key();
            print_value(
                args.json,
                serde_json::json!({"database": record.database_id, "id": key.id, "key": key.key}),
                || println!("{}  {}", record.name, record.database_id),
            );
        }
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    rt.block_on(run(args, config, associations))
}

async fn run(args: Args, config: ClientConfig, associations: Arc<AssociationManager>) -> Result<()> {
    let socket = config.socket_path.clone();
    let trigger_unlock = config.trigger_unlock;
    let mut client = ProxyClient::connect(config, associations)
        .await
        .with_context(|| format!("connecting to {}", socket.display()))?;
    debug!(version = ?client.session().proxy_version(), "connected");

    let json = args.json;
    match args.command {
        Command::Associate => {
            client.get_database_hash(trigger_unlock).await?;
            let record = client.associate().await?;
            print_value(
                json,
                serde_json::json!({"id": record.name, "hash": record.database_id}),
                || println!("Associated as `{}`", record.name),
            );
        }
        Command::TestAssociate => {
            let hash = client.get_database_hash(trigger_unlock).await?;
            let outcome = client.test_association(&hash).await?;
            let text = match outcome {
                TestOutcome::Valid => "valid",
                TestOutcome::Invalid => "invalid",
                TestOutcome::NotFound => "not associated",
            };
            print_value(json, serde_json::json!({"result": text}), || println!("{}", text));
            if outcome != TestOutcome::Valid {
                return Err(anyhow!("association is {}", text));
            }
        }
        Command::Hash => {
            let hash = client.get_database_hash(trigger_unlock).await?;
            print_value(json, serde_json::json!({"hash": hash}), || println!("{}", hash));
        }
        Command::Logins {
            url,
            submit_url,
            http_auth,
        } => {
            let entries = client
                .get_logins(GetLoginsRequest {
                    url,
                    submit_url,
                    http_auth,
                })
                .await?;
            for entry in entries {
                print_value(
                    json,
                    serde_json::json!({
                        "login": entry.login,
                        "name": entry.name,
                        "password": entry.password,
                        "uuid": entry.uuid,
                    }),
                    || println!("{}\t{}\t{}", entry.uuid, entry.login, entry.name),
                );
            }
        }
        Command::SetLogin {
            url,
            login,
            password,
            group,
            group_uuid,
            uuid,
        } => {
            let uuid = client
                .set_login(SetLoginRequest {
                    url,
                    login,
                    password,
                    group,
                    group_uuid,
                    uuid,
                    ..SetLoginRequest::default()
                })
                .await?;
            let uuid = uuid.unwrap_or_default();
            print_value(json, serde_json::json!({"uuid": uuid}), || println!("{}", uuid));
        }
        Command::GeneratePassword => {
            let password = client.generate_password().await?;
            print_value(json, serde_json::json!({"password": password}), || {
                println!("{}", password)
            });
        }
        Command::Lock => {
            client.lock_database().await?;
        }
        Command::Groups => {
            let groups = client.get_database_groups().await?;
            for (path, uuid) in groups.flatten() {
                print_value(
                    json,
                    serde_json::json!({"path": path, "uuid": uuid}),
                    || println!("{}\t{}", uuid, path),
                );
            }
        }
        Command::CreateGroup { name } => {
            let group = client.create_new_group(&name).await?;
            print_value(
                json,
                serde_json::json!({"name": group.name, "uuid": group.uuid}),
                || println!("{}\t{}", group.uuid, group.name),
            );
        }
        Command::Totp { uuid } => {
            let totp = client.get_totp(&uuid).await?;
            print_value(json, serde_json::json!({"totp": totp}), || println!("{}", totp));
        }
        Command::DeleteEntry { uuid } => {
            client.delete_entry(&uuid).await?;
        }
        Command::Autotype { url } => {
            client.request_autotype(&url).await?;
        }
        Command::Watch => loop {
            let event = client.next_event().await?;
            print_value(
                json,
                serde_json::json!({"event": format!("{:?}", event)}),
                || println!("{:?}", event),
            );
        },
        // Handled before connecting.
        Command::Associations | Command::Version => {}
    }

    Ok(())
}
