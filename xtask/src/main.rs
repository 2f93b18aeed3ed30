//! Development tasks for pcmcast
//!
//! Usage:
//!   cargo xtask install [--prefix DIR]  Install release binary (default /usr/local, requires sudo)
//!   cargo xtask uninstall [--prefix DIR] Remove the installed binary
//!   cargo xtask dist                    Build release binary and man pages into dist/

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

const DEFAULT_PREFIX: &str = "/usr/local";

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();

    if args.is_empty() {
        print_help();
        return ExitCode::SUCCESS;
    }

    let prefix = args
        .iter()
        .position(|a| a == "--prefix")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PREFIX));

    let result = match args[0].as_str() {
        "install" => install(&prefix),
        "uninstall" => uninstall(&prefix),
        "dist" => dist(),
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        cmd => {
            eprintln!("Unknown command: {}", cmd);
            print_help();
            Err(anyhow::anyhow!("Unknown command"))
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_help() {
    eprintln!(
        r#"
pcmcast development tasks

Usage: cargo xtask <COMMAND> [OPTIONS]

Commands:
  install    Build release binary and install to <prefix>/bin
  uninstall  Remove pcmcast from <prefix>/bin
  dist       Build release binary and man pages into dist/

Options:
  --prefix DIR   Install prefix (default: /usr/local)
"#
    );
}

/// Get the project root directory
fn project_root() -> anyhow::Result<PathBuf> {
    let dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => env::current_dir()?,
    };

    // xtask is in a subdirectory, go up one level
    Ok(dir.parent().unwrap_or(&dir).to_path_buf())
}

fn build_release(root: &Path, man_pages: bool) -> anyhow::Result<PathBuf> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--release", "--bin", "pcmcast"])
        .current_dir(root);
    if man_pages {
        cmd.env("PCMCAST_GEN_MANPAGES", "1");
    }

    if !cmd.status()?.success() {
        anyhow::bail!("Build failed");
    }

    let binary = root.join("target/release/pcmcast");
    if !binary.exists() {
        anyhow::bail!("Binary not found at {:?}", binary);
    }
    Ok(binary)
}

/// Run a command, escalating with sudo when the target is not writable
fn run_privileged(target_dir: &Path, program: &str, args: &[&str]) -> anyhow::Result<()> {
    let writable = fs::metadata(target_dir)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false);

    let status = if writable {
        Command::new(program).args(args).status()?
    } else {
        Command::new("sudo").arg(program).args(args).status()?
    };

    if !status.success() {
        anyhow::bail!("{} failed", program);
    }
    Ok(())
}

/// Build release binary and install to <prefix>/bin
fn install(prefix: &Path) -> anyhow::Result<()> {
    let root = project_root()?;

    println!("==> Building release binary...");
    let binary = build_release(&root, false)?;

    let bin_dir = prefix.join("bin");
    let target = bin_dir.join("pcmcast");
    println!("==> Installing to {}...", target.display());

    let source = binary.to_string_lossy().into_owned();
    let dest = target.to_string_lossy().into_owned();
    run_privileged(prefix, "install", &["-Dm755", source.as_str(), dest.as_str()])?;

    println!("==> Installed successfully!");

    // Show version
    let _ = Command::new(&target).arg("--version").status();

    Ok(())
}

/// Remove pcmcast from <prefix>/bin
fn uninstall(prefix: &Path) -> anyhow::Result<()> {
    let bin_dir = prefix.join("bin");
    let target = bin_dir.join("pcmcast");
    println!("==> Removing {}...", target.display());

    let dest = target.to_string_lossy().into_owned();
    run_privileged(&bin_dir, "rm", &["-f", dest.as_str()])?;

    println!("==> Uninstalled successfully!");
    Ok(())
}

/// Build release binary and collect it with its man pages under dist/
fn dist() -> anyhow::Result<()> {
    let root = project_root()?;

    println!("==> Building distribution binary...");
    let binary = build_release(&root, true)?;

    let dist_dir = root.join("dist");
    let man_out = dist_dir.join("man");
    fs::create_dir_all(&man_out)?;
    fs::copy(&binary, dist_dir.join("pcmcast"))?;

    // build.rs writes man pages into target/release/build/pcmcast-*/out/man
    let build_dir = root.join("target/release/build");
    let mut copied = 0;
    for entry in fs::read_dir(&build_dir)?.flatten() {
        if !entry.file_name().to_string_lossy().starts_with("pcmcast-") {
            continue;
        }
        let man_dir = entry.path().join("out/man");
        let Ok(pages) = fs::read_dir(&man_dir) else {
            continue;
        };
        for page in pages.flatten() {
            fs::copy(page.path(), man_out.join(page.file_name()))?;
            copied += 1;
        }
    }

    println!("==> Built: {}", dist_dir.display());
    println!("    {} man page(s)", copied);

    let _ = Command::new(dist_dir.join("pcmcast"))
        .arg("--version")
        .status();

    Ok(())
}
