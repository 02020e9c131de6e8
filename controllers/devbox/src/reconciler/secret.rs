//! Credential secret of a devbox.

use super::{Reconciler, child_meta, devbox_key};
use crate::credentials::{generate_ssh_keypair, random_token};
use crate::error::ControllerError;
use crate::labels::{recommended_labels, secret_name};
use crds::Devbox;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub const JWT_SECRET_KEY: &str = "DEVBOX_JWT_SECRET";
pub const PUBLIC_KEY_KEY: &str = "DEVBOX_PUBLIC_KEY";
pub const PRIVATE_KEY_KEY: &str = "DEVBOX_PRIVATE_KEY";
pub const AUTHORIZED_KEYS_KEY: &str = "DEVBOX_AUTHORIZED_KEYS";

const JWT_SECRET_LENGTH: usize = 32;

/// Fill in keys that older secrets were created without
fn backfill(data: &mut BTreeMap<String, ByteString>) -> bool {
    let mut changed = false;
    if !data.contains_key(JWT_SECRET_KEY) {
        data.insert(
            JWT_SECRET_KEY.to_string(),
            ByteString(random_token(JWT_SECRET_LENGTH).into_bytes()),
        );
        changed = true;
    }
    if !data.contains_key(AUTHORIZED_KEYS_KEY) {
        if let Some(public_key) = data.get(PUBLIC_KEY_KEY).cloned() {
            data.insert(AUTHORIZED_KEYS_KEY.to_string(), public_key);
            changed = true;
        }
    }
    changed
}

impl Reconciler {
    /// Make sure the devbox has its credential secret
    pub(crate) async fn sync_secret(&self, devbox: &Devbox) -> Result<(), ControllerError> {
        let (namespace, name) = devbox_key(devbox);
        let secret_name = secret_name(&name);

        if let Some(mut secret) = self.client.get_secret(&namespace, &secret_name).await? {
            if backfill(secret.data.get_or_insert_with(BTreeMap::new)) {
                info!(namespace = %namespace, name = %name, "Backfilling credential secret");
                self.client.update_secret(&secret).await?;
            }
            return Ok(());
        }

        let keypair = generate_ssh_keypair(&name)?;
        let data = BTreeMap::from([
            (
                JWT_SECRET_KEY.to_string(),
                ByteString(random_token(JWT_SECRET_LENGTH).into_bytes()),
            ),
            (PUBLIC_KEY_KEY.to_string(), ByteString(keypair.public_key.clone().into_bytes())),
            (PRIVATE_KEY_KEY.to_string(), ByteString(keypair.private_key.into_bytes())),
            (AUTHORIZED_KEYS_KEY.to_string(), ByteString(keypair.public_key.into_bytes())),
        ]);
        let secret = Secret {
            metadata: child_meta(devbox, secret_name, recommended_labels(&name)),
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        };

        match self.client.create_secret(&secret).await {
            Ok(_) => {
                info!(namespace = %namespace, name = %name, "Created credential secret");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!(namespace = %namespace, name = %name, "Credential secret created concurrently");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
