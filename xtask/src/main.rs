use anyhow::{bail, Context, Result};
use clap::Parser;
use std::process::Command;

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the kprobe object embedded by kdbg
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        /// Kernel architecture whose `pt_regs` layout the probes read (defaults to the host)
        #[arg(long)]
        target_arch: Option<String>,
    },
    /// Build the probes and kdbg, then run kdbg as root
    Run {
        #[arg(long)]
        target_arch: Option<String>,
        /// Arguments passed to kdbg
        #[arg(last = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, target_arch } => build_ebpf(&target, target_arch.as_deref())?,
        Cmd::Run { target_arch, args } => {
            build_ebpf("bpfel-unknown-none", target_arch.as_deref())?;
            run_kdbg(&args)?;
        }
    }

    Ok(())
}

fn build_ebpf(target: &str, target_arch: Option<&str>) -> Result<()> {
    // Release only: debug BPF builds pull in formatting code bpf-linker rejects
    let mut cmd = Command::new("cargo");
    cmd.args(["+nightly", "build", "--package", "kdbg-ebpf", "--target", target])
        .args(["-Z", "build-std=core", "--release"]);
    if let Some(arch) = target_arch {
        cmd.env("CARGO_CFG_BPF_TARGET_ARCH", arch);
    }

    let status = cmd.status().context("Failed to run cargo for kdbg-ebpf")?;
    if !status.success() {
        bail!("Failed to build eBPF program");
    }

    println!("✓ eBPF program built");
    println!("  Target: {target}");
    println!("  Registers: {}", target_arch.unwrap_or("host layout"));
    Ok(())
}

fn run_kdbg(args: &[String]) -> Result<()> {
    let status = Command::new("cargo")
        .args(["build", "--release", "--package", "kdbg"])
        .status()
        .context("Failed to build kdbg")?;
    if !status.success() {
        bail!("Failed to build kdbg");
    }

    let status = Command::new("sudo")
        .arg("-E")
        .arg("target/release/kdbg")
        .args(args)
        .status()
        .context("Failed to start kdbg")?;
    if !status.success() {
        bail!("kdbg exited with {status}");
    }
    Ok(())
}
