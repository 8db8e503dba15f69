use std::env;
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Supabase,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMode {
    /// Payments are confirmed by a timer a fixed delay after booking.
    Simulated,
    /// Payments are confirmed by the provider's webhook callback.
    Webhook,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub supabase_service_role_key: String,
    pub store_backend: StoreBackend,
    pub payment_mode: PaymentMode,
    pub payment_simulation_delay_seconds: u64,
    pub queue_slot_minutes: u32,
    pub pending_payment_timeout_minutes: i64,
    pub expiry_sweep_interval_seconds: u64,
    pub store_read_retries: u32,
    pub change_poll_interval_seconds: u64,
    pub api_port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let supabase_url = env::var("SUPABASE_URL").unwrap_or_else(|_| {
            warn!("SUPABASE_URL not set, using empty value");
            String::new()
        });

        let store_backend = match env::var("STORE_BACKEND").ok().as_deref() {
            Some("memory") => StoreBackend::Memory,
            Some("supabase") => StoreBackend::Supabase,
            Some(other) => {
                warn!("Unknown STORE_BACKEND '{}', choosing from configuration", other);
                Self::default_backend(&supabase_url)
            }
            None => Self::default_backend(&supabase_url),
        };

        let payment_mode = match env::var("PAYMENT_MODE").ok().as_deref() {
            Some("webhook") => PaymentMode::Webhook,
            Some("simulated") | None => PaymentMode::Simulated,
            Some(other) => {
                warn!("Unknown PAYMENT_MODE '{}', using simulated", other);
                PaymentMode::Simulated
            }
        };

        let config = Self {
            supabase_url,
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_SERVICE_ROLE_KEY not set, using empty value");
                    String::new()
                }),
            store_backend,
            payment_mode,
            payment_simulation_delay_seconds: numeric_var("PAYMENT_SIMULATION_DELAY_SECONDS", 5),
            queue_slot_minutes: numeric_var("QUEUE_SLOT_MINUTES", 5),
            pending_payment_timeout_minutes: numeric_var("PENDING_PAYMENT_TIMEOUT_MINUTES", 30),
            expiry_sweep_interval_seconds: numeric_var("EXPIRY_SWEEP_INTERVAL_SECONDS", 60),
            store_read_retries: numeric_var("STORE_READ_RETRIES", 3),
            change_poll_interval_seconds: numeric_var("CHANGE_POLL_INTERVAL_SECONDS", 3),
            api_port: numeric_var("API_PORT", 3000),
        };

        if config.store_backend == StoreBackend::Supabase && !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    fn default_backend(supabase_url: &str) -> StoreBackend {
        if supabase_url.is_empty() {
            StoreBackend::Memory
        } else {
            StoreBackend::Supabase
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    /// Key used for server-side writes; falls back to the anon key.
    pub fn service_key(&self) -> &str {
        if self.supabase_service_role_key.is_empty() {
            &self.supabase_anon_key
        } else {
            &self.supabase_service_role_key
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            supabase_jwt_secret: String::new(),
            supabase_service_role_key: String::new(),
            store_backend: StoreBackend::Memory,
            payment_mode: PaymentMode::Simulated,
            payment_simulation_delay_seconds: 5,
            queue_slot_minutes: 5,
            pending_payment_timeout_minutes: 30,
            expiry_sweep_interval_seconds: 60,
            store_read_retries: 3,
            change_poll_interval_seconds: 3,
            api_port: 3000,
        }
    }
}

fn numeric_var<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}
