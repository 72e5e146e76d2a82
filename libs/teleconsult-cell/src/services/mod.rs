pub mod appointments;
pub mod lifecycle;
pub mod presence;
pub mod relay;
pub mod store;
pub mod telemetry;

pub use appointments::{AppointmentDirectory, SupabaseAppointmentDirectory};
pub use lifecycle::SessionLifecycleService;
pub use presence::PresenceRegistry;
pub use relay::{RoomEvent, SignalingRelay};
pub use store::{InMemorySessionStore, SessionLocks, SessionStore, SupabaseSessionStore};
pub use telemetry::TelemetryRecorder;
