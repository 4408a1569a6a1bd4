use std::env;

/// Expose the kernel architecture the probes are built for as
/// `cfg(bpf_target_arch = "...")`, selecting the `pt_regs` layout used for
/// register capture. Override with `CARGO_CFG_BPF_TARGET_ARCH`.
fn main() {
    println!(
        "cargo::rustc-check-cfg=cfg(bpf_target_arch, values(\"x86_64\",\"arm\",\"aarch64\",\
         \"riscv64\",\"powerpc64\",\"s390x\",\"mips\"))"
    );
    println!("cargo:rerun-if-env-changed=CARGO_CFG_BPF_TARGET_ARCH");

    let arch = env::var("CARGO_CFG_BPF_TARGET_ARCH").unwrap_or_else(|_| {
        let host = env::var("HOST").unwrap_or_default();
        host.split('-').next().unwrap_or_default().to_string()
    });
    println!("cargo:rustc-cfg=bpf_target_arch=\"{arch}\"");
}
