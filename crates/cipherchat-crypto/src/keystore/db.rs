//! Key database connection and initialization.

pub use cipherchat_core::db::DatabaseError;

cipherchat_core::define_database!(KeyDatabase, "Key database migrations complete");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = KeyDatabase::open_in_memory().await;
        assert!(db.is_ok());
    }
}
