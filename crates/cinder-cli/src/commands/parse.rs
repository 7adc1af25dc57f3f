//! Print the parts of a ref

use anyhow::Result;
use cinder_asset::parse_ref;

pub fn run(asset_ref: &str) -> Result<()> {
    let parsed = parse_ref(asset_ref);

    println!("Ref: {}", asset_ref);
    println!("  Kind: {}", parsed.kind);
    let parts = [
        ("Protocol", &parsed.protocol),
        ("Storage", &parsed.storage),
        ("Protocol path", &parsed.protocol_path),
        ("Path", &parsed.path),
        ("Filename", &parsed.filename),
        ("Sub-asset", &parsed.sub_asset),
    ];
    for (label, value) in parts {
        if !value.is_empty() {
            println!("  {}: {}", label, value);
        }
    }
    println!("  Full ref: {}", parsed.full_ref);
    if !parsed.sub_asset.is_empty() {
        println!("  Without sub-asset: {}", parsed.full_ref_no_sub_asset);
    }
    Ok(())
}
