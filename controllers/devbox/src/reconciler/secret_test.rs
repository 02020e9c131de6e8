//! Unit tests for the credential secret step

#[cfg(test)]
mod tests {
    use crate::reconciler::secret::{AUTHORIZED_KEYS_KEY, JWT_SECRET_KEY, PRIVATE_KEY_KEY, PUBLIC_KEY_KEY};
    use crate::test_utils::*;
    use crds::{DevboxState, NetworkType};
    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::Secret;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn text(secret: &Secret, key: &str) -> String {
        let data = secret.data.as_ref().expect("secret data");
        String::from_utf8(data[key].0.clone()).expect("utf8")
    }

    #[tokio::test]
    async fn test_creates_secret_owned_by_devbox() {
        let harness = TestHarness::with_devbox(DevboxState::Running, NetworkType::NodePort);
        let devbox = harness.devbox();

        harness.reconciler.sync_secret(&devbox).await.unwrap();

        let secret = harness.mock.secret(NAMESPACE, DEVBOX).expect("secret created");
        assert_eq!(text(&secret, JWT_SECRET_KEY).len(), 32);
        assert!(text(&secret, PUBLIC_KEY_KEY).starts_with("ssh-ed25519 "));
        assert!(text(&secret, PRIVATE_KEY_KEY).contains("BEGIN OPENSSH PRIVATE KEY"));
        assert_eq!(text(&secret, AUTHORIZED_KEYS_KEY), text(&secret, PUBLIC_KEY_KEY));

        let owners = secret.metadata.owner_references.expect("owner references");
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Devbox");
        assert_eq!(Some(owners[0].uid.clone()), devbox.metadata.uid);
        assert_eq!(owners[0].controller, Some(true));
    }

    #[tokio::test]
    async fn test_existing_secret_is_backfilled_not_regenerated() {
        let harness = TestHarness::with_devbox(DevboxState::Running, NetworkType::NodePort);
        harness.mock.add_secret(Secret {
            metadata: ObjectMeta {
                name: Some(DEVBOX.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (PUBLIC_KEY_KEY.to_string(), ByteString(b"ssh-ed25519 AAAAold box".to_vec())),
                (PRIVATE_KEY_KEY.to_string(), ByteString(b"old-private".to_vec())),
                ("UNRELATED".to_string(), ByteString(b"keep".to_vec())),
            ])),
            ..Default::default()
        });

        harness.reconciler.sync_secret(&harness.devbox()).await.unwrap();

        let secret = harness.mock.secret(NAMESPACE, DEVBOX).unwrap();
        assert_eq!(text(&secret, PUBLIC_KEY_KEY), "ssh-ed25519 AAAAold box");
        assert_eq!(text(&secret, PRIVATE_KEY_KEY), "old-private");
        assert_eq!(text(&secret, AUTHORIZED_KEYS_KEY), "ssh-ed25519 AAAAold box");
        assert_eq!(text(&secret, JWT_SECRET_KEY).len(), 32);
        assert_eq!(text(&secret, "UNRELATED"), "keep");
    }

    #[tokio::test]
    async fn test_complete_secret_is_left_alone() {
        let harness = TestHarness::with_devbox(DevboxState::Running, NetworkType::NodePort);
        let devbox = harness.devbox();
        harness.reconciler.sync_secret(&devbox).await.unwrap();
        let writes = harness.mock.writes();

        harness.reconciler.sync_secret(&devbox).await.unwrap();

        assert_eq!(harness.mock.writes(), writes);
    }
}
