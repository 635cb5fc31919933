use secp256k1::Keypair;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;

use crate::bus::EventBus;
use crate::config::Config;
use crate::crypto::AesKey;
use crate::identity::IdentityApi;
use crate::nostr::Event;

/// Process-global key material, read-only after startup.
pub struct ModuleKeys {
    pub keypair: Keypair,
    pub pubkey: String,
    pub aes_k1: AesKey,
}

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool<Sqlite>,
    pub config: Arc<Config>,
    pub keys: Arc<ModuleKeys>,
    pub bus: Arc<dyn EventBus>,
    pub identity: Arc<dyn IdentityApi>,
}

impl AppState {
    pub fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Sign an event with the module key, stamped now.
    pub fn sign_event(&self, kind: u32, tags: Vec<Vec<String>>, content: String) -> Event {
        Event::sign(&self.keys.keypair, self.now(), kind, tags, content)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::identity::StubIdentityApi;
    use secp256k1::Secp256k1;

    /// State over in-memory SQLite, a recording bus and a stub identity
    /// provider. The writer and admin keypairs are returned for signing
    /// requests in tests.
    pub struct TestHarness {
        pub state: AppState,
        pub bus: Arc<MemoryBus>,
        pub identity: Arc<StubIdentityApi>,
        pub writer: Keypair,
        pub ledger: Keypair,
    }

    pub async fn harness() -> TestHarness {
        let secp = Secp256k1::new();
        let module = Keypair::new(&secp, &mut rand::thread_rng());
        let writer = Keypair::new(&secp, &mut rand::thread_rng());
        let ledger = Keypair::new(&secp, &mut rand::thread_rng());
        let aes_k1 = AesKey::generate();

        let config = Config {
            host: "127.0.0.1".into(),
            port: 0,
            base_url: "https://cards.test".into(),
            database_url: "sqlite::memory:".into(),
            server_aes_key_hex: aes_k1.to_string(),
            nostr_private_key: hex::encode(module.secret_key().secret_bytes()),
            nostr_public_key: module.x_only_public_key().0.to_string(),
            card_writer_pubkey: writer.x_only_public_key().0.to_string(),
            admin_pubkeys: String::new(),
            federation_id: "lawallet.test".into(),
            lawallet_api_base_url: "https://api.test".into(),
            identity_provider_api_base: "https://id.test".into(),
            ledger_public_key: ledger.x_only_public_key().0.to_string(),
            btc_gateway_public_key: "b".repeat(64),
            default_limits: String::new(),
            default_trusted_merchants: String::new(),
            payment_request_expiry_seconds: 60,
        };

        let bus = Arc::new(MemoryBus::new());
        let identity = Arc::new(StubIdentityApi::returning(Some("satoshi")));

        let state = AppState {
            pool: crate::db::test_pool().await,
            config: Arc::new(config),
            keys: Arc::new(ModuleKeys {
                keypair: module,
                pubkey: module.x_only_public_key().0.to_string(),
                aes_k1,
            }),
            bus: bus.clone(),
            identity: identity.clone(),
        };

        TestHarness {
            state,
            bus,
            identity,
            writer,
            ledger,
        }
    }
}
