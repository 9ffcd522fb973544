//! Registration state, merge policy and the farmer -> session tracker.

mod state;
mod tracker;

pub use state::{
    country_from_phone, hash_password, RegistrationExtraction, RegistrationField,
    RegistrationState,
};
pub use tracker::RegistrationTracker;
