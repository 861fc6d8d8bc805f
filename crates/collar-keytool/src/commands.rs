//! Keytool subcommands. Each writes its human-readable result to `out`.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use collar_crypto::{
    establish_session, generate_next_pre_keys, generate_pre_keys, generate_signed_pre_key,
    next_pre_key_id,
    published_bundle, replenish_pre_keys, IdentityKeys, KeyStore, PreKeys, PublishedBundle,
    Sessions, SignedPreKeys,
};
use libsignal_protocol::{IdentityKey, ProtocolAddress};
use tracing::info;

use crate::config::KeytoolConfig;

/// Signed prekey id used when a store is first provisioned.
const FIRST_SIGNED_PREKEY_ID: u32 = 1;

fn fingerprint(key: &IdentityKey) -> String {
    hex::encode(key.serialize())
}

/// Provision a fresh store with prekeys and a signed prekey, if missing.
pub fn init(store: &KeyStore, config: &KeytoolConfig, out: &mut impl Write) -> Result<()> {
    if store.pre_key_ids()?.is_empty() {
        let records = generate_pre_keys(store, 0, config.prekey_batch)?;
        writeln!(out, "generated {} prekeys", records.len())?;
    }
    if store.signed_pre_key_ids()?.is_empty() {
        generate_signed_pre_key(store, FIRST_SIGNED_PREKEY_ID)?;
        writeln!(out, "generated signed prekey {FIRST_SIGNED_PREKEY_ID}")?;
    }
    writeln!(
        out,
        "identity {}",
        fingerprint(store.identity_key_pair().identity_key())
    )?;
    Ok(())
}

pub fn show_info(store: &KeyStore, root: &Path, out: &mut impl Write) -> Result<()> {
    let pre_keys = store.pre_key_ids()?;
    writeln!(out, "store:           {}", root.display())?;
    writeln!(out, "registration id: {}", store.local_registration_id())?;
    writeln!(
        out,
        "identity:        {}",
        fingerprint(store.identity_key_pair().identity_key())
    )?;
    writeln!(out, "prekeys:         {}", pre_keys.len())?;
    writeln!(out, "next prekey id:  {}", next_pre_key_id(store)?)?;
    writeln!(out, "signed prekeys:  {:?}", store.signed_pre_key_ids()?)?;
    Ok(())
}

pub fn generate(store: &KeyStore, count: u32, out: &mut impl Write) -> Result<()> {
    let records = generate_next_pre_keys(store, count)?;
    match records.first() {
        Some(first) => writeln!(
            out,
            "generated {} prekeys from id {}",
            records.len(),
            u32::from(first.id()?)
        )?,
        None => writeln!(out, "generated no prekeys")?,
    }
    Ok(())
}

pub fn replenish(store: &KeyStore, config: &KeytoolConfig, out: &mut impl Write) -> Result<()> {
    let records = replenish_pre_keys(store, config.replenish_threshold, config.prekey_batch)?;
    if records.is_empty() {
        writeln!(out, "prekey supply is sufficient")?;
    } else {
        writeln!(out, "generated {} prekeys", records.len())?;
    }
    Ok(())
}

/// Print the public bundle as JSON.
///
/// Defaults to the lowest stored one-time prekey and the newest signed prekey.
pub fn bundle(
    store: &KeyStore,
    device_id: u32,
    pre_key_id: Option<u32>,
    signed_pre_key_id: Option<u32>,
    out: &mut impl Write,
) -> Result<()> {
    let signed_pre_key_id = match signed_pre_key_id {
        Some(id) => id,
        None => match store.signed_pre_key_ids()?.last() {
            Some(id) => *id,
            None => bail!("store has no signed prekey; run `init` first"),
        },
    };
    let pre_key_id = match pre_key_id {
        Some(id) => Some(id),
        None => store.pre_key_ids()?.first().copied(),
    };

    let bundle = published_bundle(store, device_id, pre_key_id, signed_pre_key_id)?;
    writeln!(out, "{}", serde_json::to_string_pretty(&bundle)?)?;
    Ok(())
}

pub fn list_sessions(store: &KeyStore, name: &str, out: &mut impl Write) -> Result<()> {
    let devices = store.sub_device_sessions(name)?;
    if devices.is_empty() {
        writeln!(out, "no sessions with {name}")?;
    }
    for device_id in devices {
        writeln!(out, "{name}.{device_id}")?;
    }
    Ok(())
}

pub fn delete_sessions(
    store: &KeyStore,
    name: &str,
    device_id: Option<u32>,
    out: &mut impl Write,
) -> Result<()> {
    match device_id {
        Some(device_id) => {
            let address = ProtocolAddress::new(name.to_string(), device_id.into());
            store.delete_session(&address)?;
            writeln!(out, "deleted session {address}")?;
        }
        None => {
            store.delete_all_sessions(name)?;
            writeln!(out, "deleted all sessions with {name}")?;
        }
    }
    Ok(())
}

/// Pin a peer identity key given as hex.
pub fn trust(
    store: &KeyStore,
    name: &str,
    device_id: u32,
    key_hex: &str,
    out: &mut impl Write,
) -> Result<()> {
    let bytes = hex::decode(key_hex.trim()).context("identity key is not valid hex")?;
    let key = IdentityKey::decode(&bytes).context("not a serialized identity key")?;
    let address = ProtocolAddress::new(name.to_string(), device_id.into());

    let replaced = store.save_identity(&address, &key)?;
    if replaced {
        info!(%address, "replaced pinned identity");
        writeln!(out, "replaced identity for {address}")?;
    } else {
        writeln!(out, "trusted {address}")?;
    }
    Ok(())
}

/// Establish a session with `name` from a JSON bundle (as printed by `bundle`).
pub fn establish(store: &KeyStore, name: &str, bundle_json: &str, out: &mut impl Write) -> Result<()> {
    let published: PublishedBundle =
        serde_json::from_str(bundle_json).context("failed to parse bundle JSON")?;
    let address = ProtocolAddress::new(name.to_string(), published.device_id.into());

    establish_session(store, &address, &published.into_bundle()?)
        .with_context(|| format!("failed to establish session with {address}"))?;
    writeln!(out, "established session with {address}")?;
    Ok(())
}
