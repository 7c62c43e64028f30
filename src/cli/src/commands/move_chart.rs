//! `relok move` command: relocate a chart's images and rewrite the chart.

use std::path::PathBuf;

use clap::Args;
use relok_core::config::MoverConfig;
use relok_core::request::{
    ChartMoveRequest, ChartSpec, ContainersAuth, OciImageLocation, Source, Target,
};
use relok_runtime::{ChartMover, IntermediateBundle};

use crate::output;

/// Default output template; `*` expands to `<name>-<version>`.
const DEFAULT_OUTPUT: &str = "./*.relocated.tgz";

#[derive(Args)]
pub struct MoveArgs {
    /// Chart directory, packaged chart, or intermediate bundle
    #[arg(value_name = "CHART")]
    pub chart: PathBuf,

    /// File listing image templates (defaults to the one embedded in the chart)
    #[arg(short = 'i', long = "image-hints", value_name = "FILE")]
    pub image_hints: Option<PathBuf>,

    /// Registry that replaces the original one
    #[arg(long)]
    pub registry: Option<String>,

    /// Registry to push to, keeping the original registry as a repository prefix
    #[arg(long)]
    pub prefix_registry: Option<String>,

    /// Repository prefix that replaces the original repository path
    #[arg(long = "repo-prefix")]
    pub repo_prefix: Option<String>,

    /// Push even when the target holds a different image under the same name
    #[arg(long)]
    pub force_push: bool,

    /// Output template for the rewritten chart, `*` expands to <name>-<version>
    #[arg(short, long, value_name = "TEMPLATE")]
    pub output: Option<String>,

    /// Write an intermediate bundle instead of pushing
    #[arg(long, value_name = "PATH", conflicts_with = "output")]
    pub to_archive: Option<PathBuf>,

    /// Source registry server for explicit credentials
    #[arg(long, requires_all = ["source_username", "source_password"])]
    pub source_server: Option<String>,

    #[arg(long, requires = "source_server")]
    pub source_username: Option<String>,

    #[arg(long, requires = "source_server")]
    pub source_password: Option<String>,

    /// Target registry server for explicit credentials
    #[arg(long, requires_all = ["target_username", "target_password"])]
    pub target_server: Option<String>,

    #[arg(long, requires = "target_server")]
    pub target_username: Option<String>,

    #[arg(long, requires = "target_server")]
    pub target_password: Option<String>,

    /// Allow plain-HTTP registries and unverified certificates
    #[arg(long)]
    pub insecure: bool,

    /// Push attempts per image
    #[arg(long)]
    pub retries: Option<u32>,

    /// Layer cache directory
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

pub async fn execute(args: MoveArgs) -> Result<(), Box<dyn std::error::Error>> {
    let request = build_request(&args)?;
    let config = build_config(&args);

    let mut mover = ChartMover::new(request, config).await?;
    print_plan(&mover, args.to_archive.is_some())?;

    if !args.yes && !output::confirm("Proceed with the move?")? {
        println!("Aborted");
        return Ok(());
    }

    let written = mover.move_chart().await?;
    if args.to_archive.is_some() {
        println!("Intermediate bundle written to {}", written.display());
    } else {
        println!("Relocated chart written to {}", written.display());
    }
    Ok(())
}

fn build_request(args: &MoveArgs) -> Result<ChartMoveRequest, Box<dyn std::error::Error>> {
    let source_chart = if args.chart.is_file()
        && IntermediateBundle::new(&args.chart).is_intermediate_bundle()
    {
        tracing::debug!(path = %args.chart.display(), "Source is an intermediate bundle");
        ChartSpec::IntermediateBundle {
            path: args.chart.clone(),
        }
    } else {
        ChartSpec::Local {
            path: args.chart.clone(),
        }
    };

    let rules = OciImageLocation {
        registry: args.registry.clone(),
        prefix_registry: args.prefix_registry.clone(),
        repository_prefix: args.repo_prefix.clone(),
        force_push: args.force_push,
    };

    let target_chart = match &args.to_archive {
        Some(path) => {
            if rules.has_rules() || rules.prefix_registry().is_some() {
                return Err("rewrite rules cannot be combined with --to-archive".into());
            }
            ChartSpec::IntermediateBundle { path: path.clone() }
        }
        None => ChartSpec::Local {
            path: PathBuf::from(output_template(
                args.output.as_deref().unwrap_or(DEFAULT_OUTPUT),
            )?),
        },
    };

    Ok(ChartMoveRequest {
        source: Source {
            chart: source_chart,
            image_hints_file: args.image_hints.clone(),
            containers_auth: credentials(
                &args.source_server,
                &args.source_username,
                &args.source_password,
            ),
        },
        target: Target {
            chart: target_chart,
            rules,
            containers_auth: credentials(
                &args.target_server,
                &args.target_username,
                &args.target_password,
            ),
        },
    })
}

fn build_config(args: &MoveArgs) -> MoverConfig {
    let mut config = MoverConfig::from_env();
    if let Some(retries) = args.retries {
        config.retry.attempts = retries;
    }
    if let Some(dir) = &args.cache_dir {
        config.cache_dir = dir.clone();
    }
    config.insecure |= args.insecure;
    config
}

/// Turn a `*` output template into the `%s-%s` form the packager expects.
fn output_template(raw: &str) -> Result<String, String> {
    match raw.matches('*').count() {
        1 => Ok(raw.replacen('*', "%s-%s", 1)),
        0 => Err(format!("output template '{raw}' must contain a '*' wildcard")),
        _ => Err(format!("output template '{raw}' must contain exactly one '*'")),
    }
}

fn credentials(
    server: &Option<String>,
    username: &Option<String>,
    password: &Option<String>,
) -> ContainersAuth {
    match (server, username, password) {
        (Some(server), Some(username), Some(password)) => ContainersAuth::Credentials {
            server: server.clone(),
            username: username.clone(),
            password: password.clone(),
        },
        _ => ContainersAuth::DefaultKeychain,
    }
}

fn print_plan(mover: &ChartMover, archiving: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("Images:");
    let mut images = output::new_table(&["ORIGINAL", "TARGET", "DIGEST", "ACTION"]);
    for change in mover.image_changes() {
        let action = if archiving {
            "archive"
        } else if change.already_pushed {
            "skip"
        } else {
            "push"
        };
        images.add_row(vec![
            change.original.to_string(),
            change.push_reference().to_string(),
            output::short_digest(&change.digest).to_string(),
            action.to_string(),
        ]);
    }
    println!("{images}");

    let chart_changes = mover.chart_changes()?;
    if !chart_changes.is_empty() {
        println!();
        println!("Chart changes:");
        let mut table = output::new_table(&["CHART", "PATH", "VALUE"]);
        for change in &chart_changes {
            table.add_row(vec![
                change.chart.clone(),
                change.action.path.clone(),
                change.action.value.clone(),
            ]);
        }
        println!("{table}");
    }

    println!();
    println!("Destination: {}", mover.destination().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Cli, Command};
    use clap::Parser;

    fn parse(args: &[&str]) -> MoveArgs {
        let mut argv = vec!["relok", "move"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Move(args) => args,
            _ => panic!("expected move"),
        }
    }

    #[test]
    fn test_output_template() {
        assert_eq!(
            output_template("./*.relocated.tgz").unwrap(),
            "./%s-%s.relocated.tgz"
        );
        assert!(output_template("./chart.tgz").is_err());
        assert!(output_template("./*-*.tgz").is_err());
    }

    #[test]
    fn test_request_for_registry_move() {
        let args = parse(&["./wordpress", "--registry", "harbor.local", "--force-push"]);
        let request = build_request(&args).unwrap();
        assert_eq!(
            request.source.chart,
            ChartSpec::Local {
                path: PathBuf::from("./wordpress")
            }
        );
        assert_eq!(request.target.rules.registry.as_deref(), Some("harbor.local"));
        assert!(request.target.rules.force_push);
        assert_eq!(
            request.target.chart,
            ChartSpec::Local {
                path: PathBuf::from("./%s-%s.relocated.tgz")
            }
        );
        assert_eq!(request.source.containers_auth, ContainersAuth::DefaultKeychain);
    }

    #[test]
    fn test_request_for_archive() {
        let args = parse(&["./wordpress", "--to-archive", "out.tar"]);
        let request = build_request(&args).unwrap();
        assert!(request.target.chart.is_bundle());

        let args = parse(&["./wordpress", "--to-archive", "out.tar", "--registry", "x.io"]);
        assert!(build_request(&args).is_err());

        let args = parse(&["./wordpress", "--to-archive", "out.tar", "--prefix-registry", "x.io"]);
        assert!(build_request(&args).is_err());
    }

    #[test]
    fn test_archive_conflicts_with_output() {
        let argv = ["relok", "move", "c", "--to-archive", "a.tar", "-o", "*.tgz"];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_explicit_credentials() {
        let args = parse(&[
            "./wordpress",
            "--registry",
            "harbor.local",
            "--target-server",
            "harbor.local",
            "--target-username",
            "admin",
            "--target-password",
            "secret",
        ]);
        let request = build_request(&args).unwrap();
        assert_eq!(
            request.target.containers_auth,
            ContainersAuth::Credentials {
                server: "harbor.local".to_string(),
                username: "admin".to_string(),
                password: "secret".to_string(),
            }
        );

        let partial = ["relok", "move", "c", "--target-server", "harbor.local"];
        assert!(Cli::try_parse_from(partial).is_err());
    }

    #[test]
    fn test_bundle_source_detected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("not-a-bundle.tar");
        std::fs::write(&path, b"plain file").unwrap();
        let args = parse(&[path.to_str().unwrap(), "--registry", "harbor.local"]);
        let request = build_request(&args).unwrap();
        assert!(!request.source.chart.is_bundle());
    }

    #[test]
    fn test_config_overrides() {
        let args = parse(&["c", "--registry", "r", "--retries", "5", "--insecure", "--cache-dir", "/tmp/c"]);
        let config = build_config(&args);
        assert_eq!(config.retry.attempts, 5);
        assert!(config.insecure);
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/c"));
    }
}
