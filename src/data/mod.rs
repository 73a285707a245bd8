//! Data access layer.

pub mod db {
    pub use crate::db::*;
}

pub mod metrics_storage {
    pub use crate::metrics_storage::*;
}

pub mod models {
    pub use crate::models::*;
}
