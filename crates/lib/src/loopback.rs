//! Producing loopback bodies.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use grubenhancer_mount::TempMount;

/// Where distributions supporting loopback boot ship their config.
const ISO_LOOPBACK_CFG: &str = "boot/grub/loopback.cfg";

/// Kernel arguments selecting a French locale and keyboard.
const FRENCH_ARGS: &str =
    "locale=fr_FR bootkbd=fr console-setup/layoutcode=fr console-setup/variantcode=oss";

/// Read the loopback config shipped inside the ISO image at `iso`.
///
/// The image is mounted read-only on a temporary directory for the
/// duration of the call; this requires root.
#[context("Generating loopback config from {iso}")]
pub fn generate_from_iso(iso: &Utf8Path) -> Result<String> {
    let mnt = TempMount::mount_iso(iso)?;
    let content = mnt
        .fd
        .read_to_string(ISO_LOOPBACK_CFG)
        .with_context(|| format!("Reading {ISO_LOOPBACK_CFG} from image"))?;
    tracing::debug!("Read {} bytes of loopback config from {iso}", content.len());
    Ok(content)
}

/// Append French locale arguments to every line mentioning `linux`.
pub fn add_french_translations(content: &str) -> String {
    content
        .split('\n')
        .map(|line| {
            if line.contains("linux") {
                format!("{line} {FRENCH_ARGS}")
            } else {
                line.to_owned()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
