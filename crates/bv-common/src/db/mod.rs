pub mod bid_store;
pub mod migrations;
pub mod pool;
pub mod util;

/// Declare a storage error enum that always carries the pool and postgres
/// variants, plus any module-specific ones.
macro_rules! db_error {
    ($name:ident { $($variants:tt)* }) => {
        #[derive(Debug, thiserror::Error)]
        pub enum $name {
            #[error("failed to get postgres connection: {0}")]
            Pool(#[from] deadpool_postgres::PoolError),
            #[error("postgres error: {0}")]
            Postgres(#[from] tokio_postgres::Error),
            $($variants)*
        }
    };
}

pub(crate) use db_error;

pub use bid_store::PgBidStore;
pub use migrations::{MigrationError, run_migrations};
pub use pool::{DbPoolError, PgPool, create_pool_from_url};
