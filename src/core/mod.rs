// Domain-layer modules and shared errors
pub mod period {
    pub use crate::period::*;
}

pub mod conversation {
    pub use crate::conversation::*;
}

pub mod metrics {
    pub use crate::metrics::*;
}

pub mod plans {
    pub use crate::plans::*;
}

pub mod consistency {
    pub use crate::consistency::*;
}

pub mod services {
    pub use crate::services::*;
}

pub mod errors {
    pub use crate::errors::*;
}
