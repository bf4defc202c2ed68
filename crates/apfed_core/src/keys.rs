/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::store::{Actor, FederationStore, NewActor};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Clone)]
pub struct Identity {
    pub public_key_pem: String,
    pub private_key_pem: String,
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("APFED_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "apfed", "Apfed")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

pub fn generate_keypair() -> Result<Identity> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048)?;
    identity_from_private(private_key)
}

fn identity_from_private(private_key: RsaPrivateKey) -> Result<Identity> {
    let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
    let public_key_pem = RsaPublicKey::from(&private_key)
        .to_public_key_pem(LineEnding::LF)?
        .to_string();
    Ok(Identity {
        public_key_pem,
        private_key_pem,
    })
}

/// Instance key, used to sign fetches that are not made on behalf of a user.
pub fn load_or_generate_identity(dir: impl AsRef<Path>) -> Result<Identity> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("create data dir: {}", dir.display()))?;

    let priv_path = dir.join("instance_private_key.pem");
    if priv_path.exists() {
        let pem = fs::read_to_string(&priv_path).with_context(|| format!("read {}", priv_path.display()))?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem).context("parse private key pem")?;
        return identity_from_private(private_key);
    }
    let id = generate_keypair()?;
    fs::write(&priv_path, &id.private_key_pem).with_context(|| format!("write {}", priv_path.display()))?;
    Ok(id)
}

/// Local actor for `username`, created with a fresh key pair on first use.
pub fn ensure_local_actor(store: &dyn FederationStore, base_url: &str, username: &str) -> Result<Actor> {
    if let Some(a) = store.local_actor_by_username(username)? {
        if a.private_key_pem.is_some() {
            return Ok(a);
        }
    }
    let base = base_url.trim_end_matches('/');
    let uri = format!("{base}/users/{username}");
    let id = generate_keypair()?;
    store.upsert_actor(&NewActor {
        uri: uri.clone(),
        username: username.to_string(),
        local: true,
        inbox_url: format!("{uri}/inbox"),
        shared_inbox_url: Some(format!("{base}/inbox")),
        followers_url: Some(format!("{uri}/followers")),
        public_key_pem: Some(id.public_key_pem),
        private_key_pem: Some(id.private_key_pem),
        legacy: false,
    })
}

/// The service-level actor that signs fetches, keyed with the on-disk instance identity.
pub fn instance_actor(store: &dyn FederationStore, base_url: &str, identity: &Identity) -> Result<Actor> {
    let base = base_url.trim_end_matches('/');
    let uri = format!("{base}/users/{INSTANCE_ACTOR}");
    store.upsert_actor(&NewActor {
        uri: uri.clone(),
        username: INSTANCE_ACTOR.to_string(),
        local: true,
        inbox_url: format!("{uri}/inbox"),
        shared_inbox_url: Some(format!("{base}/inbox")),
        followers_url: None,
        public_key_pem: Some(identity.public_key_pem.clone()),
        private_key_pem: Some(identity.private_key_pem.clone()),
        legacy: false,
    })
}

pub const INSTANCE_ACTOR: &str = "instance.actor";
