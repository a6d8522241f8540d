//! Process entry point: probe the environment once, prepare the pin
//! namespace, then load every configured location.

use log::{error, info, warn};

use netbpfload::env::{BuildType, EnvSnapshot, BPFLOADER_VERSION};
use netbpfload::loader::{load_all, LOCATIONS};
use netbpfload::sys::{LinuxPlatform, Platform};

/// Kernel knobs flipped before loading anything.
///
/// The JIT ones need CONFIG_BPF_JIT / CONFIG_HAVE_EBPF_JIT; the
/// unprivileged knob flipped back to enabled needs root and is only
/// enforced on kernels where the default changed (5.13+).
fn setup_sysctls(platform: &LinuxPlatform, env: &EnvSnapshot) -> bool {
    if env.running_as_root {
        if let Err(err) =
            platform.write_file("/proc/sys/kernel/unprivileged_bpf_disabled", "0\n")
        {
            warn!("enabling unprivileged bpf failed: {}", err);
            if env.is_at_least_kver(5, 13, 0) {
                return false;
            }
        }
    }
    if let Err(err) = platform.write_file("/proc/sys/net/core/bpf_jit_enable", "1\n") {
        error!("enabling the bpf jit failed: {}", err);
        return false;
    }
    if let Err(err) = platform.write_file("/proc/sys/net/core/bpf_jit_kallsyms", "1\n") {
        error!("enabling jit kallsyms failed: {}", err);
        return false;
    }
    true
}

fn build_type() -> BuildType {
    // ro.build.type is resolved by whoever execs us; default to the
    // production variant when unset.
    std::env::var("RO_BUILD_TYPE")
        .ok()
        .and_then(|v| BuildType::parse(&v))
        .unwrap_or(BuildType::User)
}

fn run() -> i32 {
    let platform = LinuxPlatform;
    let env = match EnvSnapshot::probe(build_type(), BPFLOADER_VERSION) {
        Ok(env) => env,
        Err(err) => {
            error!("failed to probe environment: {}", err);
            return 1;
        }
    };

    info!(
        "netbpfload v0.{} kver {:#07x} ({}) build {} root {}",
        env.loader_ver,
        env.kernel_ver,
        env.arch.describe(),
        env.build_type.as_str(),
        env.running_as_root
    );

    // both ends of the supported range still need a bpf-capable kernel
    if !env.is_at_least_kver(4, 9, 0) {
        error!("kernel 4.9 or newer required");
        return 1;
    }

    if !setup_sysctls(&platform, &env) {
        return 1;
    }

    match load_all(&platform, &env, &LOCATIONS) {
        Ok(()) => {
            info!("done, all objects loaded");
            0
        }
        Err(err) => {
            error!("load failed: {} [{}]", err, err.errno());
            2
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    std::process::exit(run());
}
