pub use conduit_c_api::*;
