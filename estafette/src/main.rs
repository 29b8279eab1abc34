mod server;

use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nix::{sys::signal, unistd::Pid};

use esta_user::config::*;
use esta_user::login::{hash_password, verify_password};

use server::Server;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// A development mode binding loopback ports with a demo account,
    /// NOT INTENDED FOR PRODUCTION
    #[clap(long)]
    dev: bool,

    #[clap(
        short,
        long,
        env = "ESTAFETTE_CONFIG",
        default_value = "estafette.toml"
    )]
    /// Path to the main Estafette configuration file
    config_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs the EAS + Autodiscover + SMTP server daemon
    Daemon,
    /// Reload the daemon's user list
    Reload {
        #[clap(short, long, env = "ESTAFETTE_PID")]
        pid: Option<i32>,
    },
    /// Manage static accounts
    #[clap(subcommand)]
    Account(AccountManagement),
    /// Specific tooling, for debug & experimentation only
    #[clap(subcommand)]
    Tools(ToolsCommand),
}

#[derive(Subcommand, Debug)]
enum AccountManagement {
    /// Add an account
    Add {
        #[clap(short, long)]
        login: String,
    },
    /// Delete an account
    Delete {
        #[clap(short, long)]
        login: String,
    },
    /// Change password for a given account
    ChangePassword {
        #[clap(env = "ESTAFETTE_OLD_PASSWORD")]
        maybe_old_password: Option<String>,

        #[clap(env = "ESTAFETTE_NEW_PASSWORD")]
        maybe_new_password: Option<String>,

        #[clap(short, long)]
        login: String,
    },
}

#[derive(Subcommand, Debug)]
enum ToolsCommand {
    /// Hash a password for the user-list file
    PasswordHash {
        #[clap(env = "ESTAFETTE_PASSWORD")]
        maybe_password: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        // LOG_LEVEL=DEBUG turns on the per-request WBXML hex dumps.
        let level = match std::env::var("LOG_LEVEL").as_deref() {
            Ok("DEBUG") | Ok("debug") => "debug",
            Ok("TRACE") | Ok("trace") => "trace",
            Ok("WARN") | Ok("warn") => "warn",
            _ => "info",
        };
        std::env::set_var(
            "RUST_LOG",
            format!("main={level},estafette={level},esta_proto={level},esta_store={level},esta_user={level}"),
        )
    }

    // Abort on panic (same behavior as in Go)
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("{}", panic_info);
        eprintln!("{:?}", backtrace::Backtrace::new());
        std::process::abort();
    }));

    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let load_config = || -> Result<ProviderConfig> {
        let mut config: ProviderConfig = read_config(args.config_file.clone())?;
        config.apply_env_overrides();
        Ok(config)
    };

    match &args.command {
        Command::Daemon => {
            let server = if args.dev {
                Server::from_dev_config(dev_config()).await?
            } else {
                Server::from_config(load_config()?).await?
            };
            server.run().await?;
        }
        Command::Reload { pid } => {
            let pid_path = load_config().ok().and_then(|c| c.pid);
            reload(*pid, pid_path)?;
        }
        Command::Account(cmd) => {
            let config = load_config()
                .context("account management needs the daemon configuration for the user list path")?;
            account_management(cmd, config.users.user_list)?;
        }
        Command::Tools(ToolsCommand::PasswordHash { maybe_password }) => {
            let password = match maybe_password {
                Some(pwd) => pwd.clone(),
                None => rpassword::prompt_password("Enter password: ")?,
            };
            println!("{}", hash_password(&password)?);
        }
    }

    Ok(())
}

fn dev_config() -> ProviderConfig {
    use std::net::*;
    ProviderConfig {
        pid: None,
        eas: None,
        eas_unsecure: Some(EasUnsecureConfig {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8087),
        }),
        smtp: Some(SmtpConfig {
            mta_bind_addr: Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1025)),
            submission_bind_addr: None,
            submission_tls_bind_addr: None,
            hostname: "example.tld".to_string(),
            certs: None,
            key: None,
        }),
        autodiscover: AutodiscoverConfig::default(),
        state_dir: std::env::temp_dir().join("estafette-dev"),
        secret_key: None,
        users: LoginStaticConfig {
            user_list: PathBuf::from("/dev/null"),
        },
    }
}

fn reload(pid: Option<i32>, pid_path: Option<PathBuf>) -> Result<()> {
    let final_pid = match (pid, pid_path) {
        (Some(pid), _) => pid,
        (_, Some(path)) => {
            let mut f = std::fs::OpenOptions::new().read(true).open(path)?;
            let mut pidstr = String::new();
            f.read_to_string(&mut pidstr)?;
            pidstr.parse::<i32>()?
        }
        _ => bail!("Unable to infer your daemon's PID"),
    };
    let pid = Pid::from_raw(final_pid);
    signal::kill(pid, signal::Signal::SIGUSR1)?;
    Ok(())
}

fn account_management(cmd: &AccountManagement, users: PathBuf) -> Result<()> {
    let mut ulist: UserList = read_config(users.clone()).unwrap_or_default();

    match cmd {
        AccountManagement::Add { login } => {
            tracing::debug!(user = login, "will-create");

            let password = {
                let password = rpassword::prompt_password("Enter password: ")?;
                let password_confirm = rpassword::prompt_password("Confirm password: ")?;
                if password != password_confirm {
                    bail!("Passwords don't match.");
                }
                password
            };
            let hash = hash_password(password.as_str()).context("unable to hash password")?;

            ulist.insert(
                login.clone(),
                UserEntry {
                    password: hash,
                    active: true,
                    display_name: None,
                },
            );

            write_config(users.clone(), &ulist)?;
        }
        AccountManagement::Delete { login } => {
            tracing::debug!(user = login, "will-delete");
            ulist.remove(login);
            write_config(users.clone(), &ulist)?;
        }
        AccountManagement::ChangePassword {
            maybe_old_password,
            maybe_new_password,
            login,
        } => {
            let mut user = ulist.remove(login).context("user must exist first")?;

            let old_password = match maybe_old_password {
                Some(pwd) => pwd.to_string(),
                None => rpassword::prompt_password("Enter old password: ")?,
            };

            if !verify_password(&old_password, &user.password)? {
                bail!(format!("invalid password for login {}", login));
            }

            let new_password = match maybe_new_password {
                Some(pwd) => pwd.to_string(),
                None => {
                    let password = rpassword::prompt_password("Enter new password: ")?;
                    let password_confirm = rpassword::prompt_password("Confirm new password: ")?;
                    if password != password_confirm {
                        bail!("Passwords don't match.");
                    }
                    password
                }
            };
            user.password = hash_password(&new_password)?;

            ulist.insert(login.clone(), user);
            write_config(users.clone(), &ulist)?;
        }
    };

    Ok(())
}
