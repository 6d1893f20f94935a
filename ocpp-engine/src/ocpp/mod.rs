//! OCPP-J protocol layer
//!
//! - `messages`: text framing (CALL, CALLRESULT, CALLERROR) and the shared message model
//! - `binary`: length-prefixed binary framing of the same messages
//! - `types`: message schemas

pub mod binary;
pub mod messages;
pub mod types;

pub use messages::*;
