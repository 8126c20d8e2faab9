//! Authentication: sessions, offline fallback and the auth state machine.
//!
//! - `CircuitBreaker`: pure policy deciding when backend calls may go out
//! - `EmergencySessionManager`: credential capture and short offline sessions
//! - `AuthStore`: reducer-driven state that hosts observe
//! - `AuthController`: performs the I/O and reports it to the store

pub mod circuit_breaker;
pub mod controller;
pub mod credentials;
pub mod emergency;
pub mod session;
pub mod state;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitState};
pub use controller::{AuthController, AuthError, SignIn};
pub use credentials::EmergencyCredentials;
pub use emergency::EmergencySessionManager;
pub use session::{Session, SessionOrigin};
pub use state::{reduce, AuthAction, AuthState, AuthStore};
