mod cli;
mod compression;
mod config;
mod entry;
mod forest;
mod hashing;
mod manifest_file;
mod openpgp;
mod profile;
mod util;
mod verify;

use anyhow::{Context, anyhow, bail};
use chrono::Utc;
use cli::{Cli, Command, CommonArgs, UpdateArgs};
use compression::manifest_filenames;
use config::Config;
use entry::FileKind;
use forest::{
    ForestError, ForestOptions, ManifestForest, find_top_level_manifest, log_and_continue,
    raise_on_mismatch,
};
use openpgp::{GnuPg, OpenPgpEnvironment};
use std::fmt as stdfmt;
use std::io::{IsTerminal, stderr};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::SystemTime;
use tracing::{Event, Level, Subscriber, error, info};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt as tracing_fmt;
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use util::paths::relpath_from_path;
use verify::ManifestMismatch;

struct ManitreeExitCode;

impl ManitreeExitCode {
    /// Exit code used when verification found differences.
    fn verification_failed() -> ExitCode {
        ExitCode::from(1)
    }

    /// Exit code used for other errors (I/O errors, invalid arguments, etc.).
    fn any_error() -> ExitCode {
        ExitCode::from(255)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_level.as_deref());

    // Change working directory if -C was specified
    if let Some(directory) = cli.directory
        && let Err(e) = std::env::set_current_dir(&directory)
    {
        error!(
            "Failed to change directory to {}: {}",
            directory.display(),
            e
        );
        return ManitreeExitCode::any_error();
    }

    let config_path = cli.config.as_deref();
    let result: anyhow::Result<ExitCode> = match cli.command {
        Command::Verify {
            paths,
            keep_going,
            require_signed_manifest,
            common,
        } => handle_verify(&paths, keep_going, require_signed_manifest, &common, config_path),
        Command::Update {
            paths,
            update,
            common,
        } => handle_update(&paths, &update, &common, config_path),
        Command::Create {
            path,
            update,
            common,
        } => handle_create(&path, &update, &common, config_path),
    };

    match result {
        Ok(exit_code) => exit_code,
        Err(err) => {
            error!("{err:#}");
            ManitreeExitCode::any_error()
        }
    }
}

/// A path resolved against the tree it belongs to.
struct TreePath {
    top_level_manifest: PathBuf,
    relpath: String,
    is_dir: bool,
}

fn locate(path: &Path, allow_xdev: bool) -> anyhow::Result<TreePath> {
    let path = match path.canonicalize() {
        Ok(path) => path,
        // a deleted file is still verified (and dropped) through its parent
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                bail!("Cannot access {}: {}", path.display(), e);
            };
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            parent
                .canonicalize()
                .with_context(|| format!("Cannot access {}", parent.display()))?
                .join(name)
        }
        Err(e) => return Err(e).with_context(|| format!("Cannot access {}", path.display())),
    };
    let is_dir = path.is_dir();
    let start = if is_dir {
        path.as_path()
    } else {
        path.parent()
            .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?
    };

    let top_level_manifest = find_top_level_manifest(start, allow_xdev)?.ok_or_else(|| {
        anyhow!(
            "No top-level Manifest found above {} (use 'manitree create' to start a tree)",
            path.display()
        )
    })?;
    let root = top_level_manifest
        .parent()
        .ok_or_else(|| anyhow!("Invalid Manifest path {}", top_level_manifest.display()))?;
    let relpath = path
        .strip_prefix(root)
        .ok()
        .and_then(relpath_from_path)
        .ok_or_else(|| anyhow!("{} is outside of the tree at {}", path.display(), root.display()))?;

    Ok(TreePath {
        top_level_manifest,
        relpath,
        is_dir,
    })
}

fn tree_root(top_level_manifest: &Path) -> &Path {
    match top_level_manifest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn openpgp_environment(config: &Config) -> Box<dyn OpenPgpEnvironment> {
    Box::new(GnuPg {
        program: config.openpgp.program.clone(),
        homedir: config.openpgp.homedir.clone(),
    })
}

/// Applies command line overrides on top of the configuration file.
fn apply_update_args(config: &mut Config, args: &UpdateArgs) -> anyhow::Result<()> {
    if let Some(hashes) = &args.hashes {
        config.hashes = hashes.split_whitespace().map(str::to_string).collect();
    }
    if let Some(profile) = &args.profile {
        config.profile = profile.clone();
    }
    if args.compress_watermark.is_some() {
        config.compress_watermark = args.compress_watermark;
    }
    if let Some(format) = args.compress_format {
        config.compress_format = format;
    }
    if args.sign {
        config.openpgp.sign = Some(true);
    } else if args.no_sign {
        config.openpgp.sign = Some(false);
    }
    if args.openpgp_id.is_some() {
        config.openpgp.key = args.openpgp_id.clone();
    }
    if args.sort {
        config.sort = true;
    }
    config.validate()?;
    Ok(())
}

fn apply_common_args(config: &mut Config, args: &CommonArgs) {
    if args.no_openpgp_verify {
        config.openpgp.verify = false;
    }
    if args.allow_xdev {
        config.allow_xdev = true;
    }
}

fn forest_options(config: &Config, allow_create: bool) -> ForestOptions {
    ForestOptions {
        verify_openpgp: config.openpgp.verify,
        allow_create,
        allow_xdev: config.allow_xdev,
        hashes: config.hashes.clone(),
        sign_openpgp: config.openpgp.sign,
        openpgp_keyid: config.openpgp.key.clone(),
        compress_watermark: config.compress_watermark,
        compress_format: config.compress_format,
        sort: config.sort,
    }
}

fn open_forest(
    top_level_manifest: &Path,
    config: &Config,
    allow_create: bool,
) -> anyhow::Result<ManifestForest> {
    let profile = profile::profile_by_name(&config.profile)
        .ok_or_else(|| anyhow!("Unknown profile: {}", config.profile))?;
    let forest = ManifestForest::new(
        top_level_manifest,
        forest_options(config, allow_create),
        profile,
        Some(openpgp_environment(config)),
    )?;
    Ok(forest)
}

fn incremental_since(forest: &ManifestForest, incremental: bool) -> Option<SystemTime> {
    if !incremental {
        return None;
    }
    let ts = forest.find_timestamp();
    if ts.is_none() {
        info!("No TIMESTAMP recorded, checking all files");
    }
    ts.map(SystemTime::from)
}

fn handle_verify(
    paths: &[PathBuf],
    keep_going: bool,
    require_signed_manifest: bool,
    common: &CommonArgs,
    config_path: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    let mut all_ok = true;
    for path in paths {
        let target = locate(path, common.allow_xdev)?;
        let mut config = Config::load(config_path, tree_root(&target.top_level_manifest))?;
        apply_common_args(&mut config, common);

        let mut forest = open_forest(&target.top_level_manifest, &config, false)?;
        if require_signed_manifest {
            let signed = forest
                .top_level_manifest()
                .is_some_and(|m| m.openpgp_signed && m.openpgp_signature.is_some());
            if !signed {
                bail!(
                    "{} is not OpenPGP-signed (or the signature was not verified)",
                    target.top_level_manifest.display()
                );
            }
        }
        if let Some(signature) = forest.top_level_manifest().and_then(|m| m.openpgp_signature.as_ref()) {
            info!(
                "Valid OpenPGP signature by {} (primary key {})",
                signature.fingerprint, signature.primary_key_fingerprint
            );
        }

        let last_mtime = incremental_since(&forest, common.incremental);
        let on_failure: fn(ManifestMismatch) -> Result<bool, ForestError> = if keep_going {
            log_and_continue
        } else {
            raise_on_mismatch
        };
        let result = if target.is_dir {
            forest.assert_directory_verifies(&target.relpath, on_failure, last_mtime)
        } else {
            forest.assert_path_verifies(&target.relpath, on_failure, last_mtime)
        };

        match result {
            Ok(true) => info!("{} verified successfully", path.display()),
            Ok(false) => all_ok = false,
            Err(ForestError::Mismatch(mismatch)) => {
                error!("{}", mismatch);
                all_ok = false;
            }
            Err(e) => return Err(e.into()),
        }
    }

    if all_ok {
        Ok(ExitCode::SUCCESS)
    } else {
        error!("Verification failed");
        Ok(ManitreeExitCode::verification_failed())
    }
}

/// Updates `relpath` in `forest`, stamps it if requested and saves.
fn update_and_save(
    forest: &mut ManifestForest,
    relpath: &str,
    is_dir: bool,
    update: &UpdateArgs,
    incremental: bool,
) -> anyhow::Result<()> {
    let hashes = forest.options().hashes.clone();
    let last_mtime = incremental_since(forest, incremental);

    if is_dir {
        forest.update_entries_for_directory(relpath, &hashes, last_mtime, false)?;
    } else {
        forest.update_entry_for_path(relpath, FileKind::Data, Some(&hashes))?;
    }
    if update.timestamp {
        forest.set_timestamp(Utc::now());
    }

    let written = forest.save_manifests(Some(&hashes), update.force_rewrite, None, None, None)?;
    if written.is_empty() {
        info!("No changes");
    } else {
        info!("Updated {} Manifest(s)", written.len());
    }
    Ok(())
}

fn handle_update(
    paths: &[PathBuf],
    update: &UpdateArgs,
    common: &CommonArgs,
    config_path: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    for path in paths {
        let target = locate(path, common.allow_xdev)?;
        let mut config = Config::load(config_path, tree_root(&target.top_level_manifest))?;
        apply_common_args(&mut config, common);
        apply_update_args(&mut config, update)?;

        let mut forest = open_forest(&target.top_level_manifest, &config, false)?;
        update_and_save(
            &mut forest,
            &target.relpath,
            target.is_dir,
            update,
            common.incremental,
        )?;
    }
    Ok(ExitCode::SUCCESS)
}

fn handle_create(
    path: &Path,
    update: &UpdateArgs,
    common: &CommonArgs,
    config_path: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    if !path.is_dir() {
        bail!("{} is not a directory", path.display());
    }
    if let Some(existing) = manifest_filenames()
        .map(|name| path.join(name))
        .find(|p| p.exists())
    {
        bail!(
            "{} already exists (use 'manitree update' instead)",
            existing.display()
        );
    }

    let mut config = Config::load(config_path, path)?;
    apply_common_args(&mut config, common);
    apply_update_args(&mut config, update)?;

    let top_level_manifest = path.join(compression::MANIFEST_FILENAME);
    let mut forest = open_forest(&top_level_manifest, &config, true)?;
    update_and_save(&mut forest, "", true, update, false)?;
    info!(
        "Created {}",
        path.join(forest.top_level_manifest_filename()).display()
    );
    Ok(ExitCode::SUCCESS)
}

fn init_tracing(verbose: u8, log_level: Option<&str>) {
    let stderr_is_terminal = stderr().is_terminal();
    let formatter = EmojiFormatter { stderr_is_terminal };

    let filter = match (log_level, verbose) {
        (Some(level), _) => EnvFilter::new(level),
        (None, 0) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        (None, 1) => EnvFilter::new("info"),
        (None, _) => EnvFilter::new("debug"),
    };

    let fmt_layer = tracing_fmt::layer()
        .event_format(formatter)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

struct EmojiFormatter {
    stderr_is_terminal: bool,
}

impl<S, N> FormatEvent<S, N> for EmojiFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        if self.stderr_is_terminal {
            match *event.metadata().level() {
                Level::DEBUG => write!(writer, "🔍 ")?,
                Level::INFO => write!(writer, "ℹ️ ")?,
                Level::WARN => write!(writer, "⚠️  ")?,
                Level::ERROR => write!(writer, "❌️ ")?,
                _ => {}
            }
        } else {
            match *event.metadata().level() {
                Level::DEBUG => writer.write_str("DEBUG: ")?,
                Level::INFO => writer.write_str("INFO: ")?,
                Level::WARN => writer.write_str("WARN: ")?,
                Level::ERROR => writer.write_str("ERROR: ")?,
                _ => {}
            }
        }

        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_args_override_config() {
        let mut config = Config::default();
        let args = UpdateArgs {
            hashes: Some("SHA256  MD5".to_string()),
            profile: Some("ebuild".to_string()),
            sign: true,
            openpgp_id: Some("0xABCD".to_string()),
            sort: true,
            ..Default::default()
        };
        apply_update_args(&mut config, &args).unwrap();
        assert_eq!(config.hashes, vec!["SHA256", "MD5"]);
        assert_eq!(config.profile, "ebuild");
        assert_eq!(config.openpgp.sign, Some(true));
        assert_eq!(config.openpgp.key.as_deref(), Some("0xABCD"));
        assert!(config.sort);

        let options = forest_options(&config, true);
        assert!(options.allow_create);
        assert_eq!(options.sign_openpgp, Some(true));
        assert_eq!(options.openpgp_keyid.as_deref(), Some("0xABCD"));
    }

    #[test]
    fn test_signing_left_to_loaded_state_by_default() {
        let mut config = Config::default();
        apply_update_args(&mut config, &UpdateArgs::default()).unwrap();
        assert_eq!(forest_options(&config, false).sign_openpgp, None);

        let args = UpdateArgs {
            no_sign: true,
            ..Default::default()
        };
        apply_update_args(&mut config, &args).unwrap();
        assert_eq!(forest_options(&config, false).sign_openpgp, Some(false));
    }

    #[test]
    fn test_update_args_rejects_unknown_hash() {
        let mut config = Config::default();
        let args = UpdateArgs {
            hashes: Some("SHA512 CRC32".to_string()),
            ..Default::default()
        };
        assert!(apply_update_args(&mut config, &args).is_err());
    }

    #[test]
    fn test_common_args() {
        let mut config = Config::default();
        apply_common_args(
            &mut config,
            &CommonArgs {
                no_openpgp_verify: true,
                allow_xdev: true,
                incremental: false,
            },
        );
        assert!(!config.openpgp.verify);
        assert!(config.allow_xdev);
    }
}
