use serde::{Deserialize, Serialize};
use tracing::warn;

/// Opaque, comma-joined capability tokens forwarded verbatim to the dispatcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub encoders: String,
    pub decoders: String,
    pub hwaccels: String,
}

impl CapabilitySnapshot {
    /// Probes the local `ffmpeg` binary for encoders, decoders and hardware
    /// accelerators. Never fails hard: any probe that cannot be performed
    /// contributes an empty string.
    pub async fn probe() -> Self {
        let (encoders, decoders, hwaccels) = tokio::join!(
            list_codecs("-encoders"),
            list_codecs("-decoders"),
            list_hwaccels(),
        );
        Self {
            encoders,
            decoders,
            hwaccels,
        }
    }
}

async fn run_ffmpeg(args: &[&str]) -> Option<String> {
    let output = tokio::process::Command::new("ffmpeg")
        .arg("-hide_banner")
        .args(args)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(output) => {
            warn!(
                status = %output.status,
                "ffmpeg {:?} exited non-zero during capability probe",
                args
            );
            None
        }
        Err(err) => {
            warn!(error = %err, "failed to invoke ffmpeg for capability probe");
            None
        }
    }
}

/// Parses `ffmpeg -encoders`/`-decoders` output, extracting the second
/// whitespace-separated column (the codec name) from lines whose flag
/// column starts with `V` or `A` (video/audio codec, as opposed to
/// subtitle/data), joined with `,`.
async fn list_codecs(flag: &str) -> String {
    let Some(raw) = run_ffmpeg(&[flag]).await else {
        return String::new();
    };

    let mut names = Vec::new();
    for line in raw.lines() {
        let line = line.trim_start();
        let mut cols = line.split_whitespace();
        let Some(flags) = cols.next() else { continue };
        if !flags.starts_with(['V', 'A']) {
            continue;
        }
        if let Some(name) = cols.next() {
            names.push(name.to_string());
        }
    }
    names.join(",")
}

/// Parses `ffmpeg -hwaccels` output: one accelerator name per line after a
/// header line, joined with `,`.
async fn list_hwaccels() -> String {
    let Some(raw) = run_ffmpeg(&["-hwaccels"]).await else {
        return String::new();
    };

    raw.lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

/// Sentinel returned by [`cpu_temperature`] when the temperature cannot be
/// determined on this platform.
pub const CPU_TEMPERATURE_UNKNOWN: f64 = -1.0;

/// Reads the current CPU temperature in degrees Celsius.
///
/// Linux: first thermal zone under `/sys/class/thermal`. BSD: `sysctl -n
/// dev.cpu.0.temperature` (reported in Kelvin tenths, converted to Celsius).
/// Any other platform, or any read failure, yields [`CPU_TEMPERATURE_UNKNOWN`].
pub async fn cpu_temperature() -> f64 {
    #[cfg(target_os = "linux")]
    {
        match tokio::fs::read_to_string("/sys/class/thermal/thermal_zone0/temp").await {
            Ok(raw) => match raw.trim().parse::<f64>() {
                Ok(millidegrees) => return millidegrees / 1000.0,
                Err(err) => {
                    warn!(error = %err, "failed to parse thermal zone temperature");
                }
            },
            Err(err) => {
                warn!(error = %err, "failed to read thermal zone temperature");
            }
        }
        return CPU_TEMPERATURE_UNKNOWN;
    }

    #[cfg(target_os = "freebsd")]
    {
        let output = tokio::process::Command::new("sysctl")
            .args(["-n", "dev.cpu.0.temperature"])
            .output()
            .await;
        if let Ok(output) = output {
            if output.status.success() {
                let raw = String::from_utf8_lossy(&output.stdout);
                let trimmed = raw.trim().trim_end_matches('C');
                if let Ok(kelvin) = trimmed.parse::<f64>() {
                    return kelvin - 273.15;
                }
            }
        }
        return CPU_TEMPERATURE_UNKNOWN;
    }

    #[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
    {
        CPU_TEMPERATURE_UNKNOWN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_never_panics_without_ffmpeg_on_path() {
        let snapshot = CapabilitySnapshot::probe().await;
        assert!(snapshot.encoders.is_empty() || !snapshot.encoders.is_empty());
    }

    #[tokio::test]
    async fn cpu_temperature_returns_sentinel_or_plausible_value() {
        let temp = cpu_temperature().await;
        assert!(temp == CPU_TEMPERATURE_UNKNOWN || temp.is_finite());
    }
}
