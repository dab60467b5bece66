//! nsbox CLI - Command line front-end for the isolation primitives

use clap::{Parser, Subcommand};
use nsbox_core::config::default_cgroup_root;
use nsbox_core::isolation::{Cgroup, list_controllers};
use nsbox_core::{LaunchConfig, MountTable, Vfs, launch};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "nsbox")]
#[command(author, version, about = "Run programs in fresh Linux namespaces and cgroups")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chroot into ROOT and run a program in new namespaces
    Run {
        /// New filesystem root
        root: PathBuf,

        /// Program to run, as seen from inside ROOT
        program: PathBuf,

        /// Arguments for the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Also create a user namespace
        #[arg(long)]
        user: bool,
    },

    /// Create a cgroup, join it and run a program in new namespaces
    Cgroup {
        /// Name of the cgroup, must be a valid directory name
        #[arg(short, long, default_value = "nsbox")]
        name: String,

        /// Where cgroups are mounted (defaults to NSBOX_CGROUP_ROOT or /sys/fs/cgroup)
        #[arg(long)]
        cg_root: Option<PathBuf>,

        /// key=value environment variables
        #[arg(short, long, value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// The program to run
        #[arg(short, long)]
        program: PathBuf,

        /// Arguments for the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Remove a cgroup, moving its tasks back to the root
    Destroy {
        /// Name of the cgroup
        #[arg(short, long)]
        name: String,

        /// Where cgroups are mounted (defaults to NSBOX_CGROUP_ROOT or /sys/fs/cgroup)
        #[arg(long)]
        cg_root: Option<PathBuf>,
    },

    /// List the cgroup controllers the kernel provides
    Controllers,

    /// Show the mount table
    Mounts {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn parse_env(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {value:?}"))
}

fn main() -> ExitCode {
    if let Err(e) = init_logging() {
        eprintln!("nsbox: {e}");
        return ExitCode::FAILURE;
    }

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("nsbox=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run {
            root,
            program,
            args,
            user,
        } => {
            let config = LaunchConfig::builder()
                .root(root)
                .program(program)
                .args(args)
                .namespaces(nsbox_core::isolation::NamespaceConfig { user, net: false })
                .build();

            let outcome = launch(&config)?;
            Ok(exit_code(outcome.exit_code()))
        }

        Commands::Cgroup {
            name,
            cg_root,
            env,
            program,
            args,
        } => {
            let cg_root = cg_root.unwrap_or_else(default_cgroup_root);
            let vfs = Vfs::open(&cg_root)?;
            match vfs.is_cgroupfs() {
                Ok(true) => {}
                Ok(false) => tracing::warn!(root = %vfs, "does not appear to be a cgroup filesystem"),
                Err(e) => tracing::warn!(root = %vfs, "does not appear to be a cgroup filesystem: {e}"),
            }

            let mut builder = LaunchConfig::builder()
                .cgroup(name)
                .cgroup_root(cg_root)
                .program(program)
                .args(args);
            for (key, value) in env {
                builder = builder.env(key, value);
            }

            let outcome = launch(&builder.build())?;
            Ok(exit_code(outcome.exit_code()))
        }

        Commands::Destroy { name, cg_root } => {
            let vfs = Vfs::open(cg_root.unwrap_or_else(default_cgroup_root))?;
            let failures = Cgroup::open(&vfs, &name)?.destroy()?;
            for failure in &failures {
                tracing::warn!("{failure}");
            }
            Ok(if failures.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }

        Commands::Controllers => {
            for controller in list_controllers()? {
                println!("{controller}");
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Mounts { json } => {
            let table = MountTable::read()?;
            if json {
                let entries: Vec<&Vfs> = table.iter().map(|(_, entry)| entry).collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for (_, entry) in table.iter() {
                    println!(
                        "{} {} {} {}",
                        entry.device,
                        entry.mountpoint.display(),
                        entry.filesystem,
                        entry.options.join(",")
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}
