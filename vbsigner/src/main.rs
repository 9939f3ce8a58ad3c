mod curve;
mod imgsigner;

use anyhow::{bail, Context};
use curve::{import_signing_key, CurveType};
use imgsigner::sign_image;

use std::env;
use std::fs;

/// Signs a raw firmware binary into a bootable container:
///
/// ```text
/// vbsigner <firmware.bin> <key-file> <algorithm> <version> [output.bin]
/// ```
///
/// The key file holds the raw 32-byte signing scalar. Supported
/// algorithms: `nistp256`, plus `ed25519` when built with the `ed25519`
/// feature. Exits non-zero on a missing key, an unknown algorithm or a
/// firmware that does not fit the partition.
fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 5 {
        bail!("usage: vbsigner <firmware.bin> <key-file> <algorithm> <version> [output.bin]");
    }
    let image_path = &args[1];
    let key_path = &args[2];
    let algorithm = &args[3];
    let version: u32 = args[4]
        .parse()
        .with_context(|| format!("bad version {:?}", args[4]))?;

    let key_file =
        fs::read(key_path).with_context(|| format!("cannot read key file {:?}", key_path))?;
    let sk = match algorithm.as_str() {
        "nistp256" => import_signing_key(CurveType::NistP256, &key_file)?,
        #[cfg(feature = "ed25519")]
        "ed25519" => import_signing_key(CurveType::Ed25519, &key_file)?,
        other => bail!("unsupported algorithm {:?}", other),
    };

    let fw_blob =
        fs::read(image_path).with_context(|| format!("cannot read firmware {:?}", image_path))?;
    log::info!("signing {} ({} bytes)", image_path, fw_blob.len());
    let signed = sign_image(fw_blob, image_path, sk, version)?;

    let output = if args.len() > 5 {
        args[5].clone()
    } else {
        format!("{}_v{}_signed.bin", image_path.trim_end_matches(".bin"), version)
    };
    fs::write(&output, &signed).with_context(|| format!("cannot write {:?}", output))?;
    println!("{} bytes written to {}", signed.len(), output);
    Ok(())
}
