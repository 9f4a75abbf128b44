use rician_nlm_core::phantom::{add_rician_noise, cylinder_phantom, rmse};
use rician_nlm_core::{estimate_memory_bytes, DenoiseEngine, NlmConfig};
use std::time::Instant;

fn parse_arg<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> T {
    args.windows(2)
        .find(|w| w[0] == flag)
        .and_then(|w| w[1].parse::<T>().ok())
        .unwrap_or(default)
}

fn peak_rss_mb() -> Option<f64> {
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    #[cfg(target_os = "macos")]
    {
        Some(usage.ru_maxrss as f64 / (1024.0 * 1024.0))
    }
    #[cfg(not(target_os = "macos"))]
    {
        Some(usage.ru_maxrss as f64 / 1024.0)
    }
}

fn main() {
    simple_logger::init_with_level(log::Level::Info).expect("logger already initialized");

    let args: Vec<String> = std::env::args().collect();
    let x = parse_arg(&args, "--x", 126usize);
    let y = parse_arg(&args, "--y", 126usize);
    let z = parse_arg(&args, "--z", 256usize);
    let noise = parse_arg(&args, "--noise", 1.0f64);
    let patch_size = parse_arg(&args, "--patch-size", 2usize);
    let patch_distance = parse_arg(&args, "--patch-distance", 6usize);
    let exact = args.iter().any(|a| a == "--exact");

    let config = NlmConfig::new()
        .with_patch_size(patch_size)
        .with_patch_distance(patch_distance)
        .with_fast_mode(!exact);

    println!(
        "phantom bench start shape=({}, {}, {}) noise={} patch={} distance={} mode={} predicted_mb={:.1}",
        x,
        y,
        z,
        noise,
        patch_size,
        patch_distance,
        if exact { "exact" } else { "fast" },
        estimate_memory_bytes(&[x, y, z], &config) as f64 / (1024.0 * 1024.0)
    );

    let phantom = cylinder_phantom((x, y, z));
    let noisy = add_rician_noise(phantom.view(), noise, 42).expect("invalid noise level");

    let rss_before_mb = peak_rss_mb().unwrap_or(0.0);

    let t0 = Instant::now();
    let engine = DenoiseEngine::new(config).expect("invalid configuration");
    let output = engine
        .denoise(noisy.view().into_dyn())
        .expect("rician_denoise_nl_means failed");
    let elapsed = t0.elapsed();
    let rss_peak_mb = peak_rss_mb().unwrap_or(0.0);

    let rmse_before = rmse(noisy.view().into_dyn(), phantom.view().into_dyn()).unwrap_or(f64::NAN);
    let rmse_after = rmse(output.volume.view(), phantom.view().into_dyn()).unwrap_or(f64::NAN);

    println!(
        "phantom bench done elapsed_s={:.3} sigma={:.4} h={:.4} underflow={} rmse_before={:.4} rmse_after={:.4} rss_before_mb={:.1} rss_peak_mb={:.1}",
        elapsed.as_secs_f64(),
        output.report.sigma,
        output.report.h,
        output.report.underflow_voxels,
        rmse_before,
        rmse_after,
        rss_before_mb,
        rss_peak_mb
    );
}
