//! Rate limiting logic and state management.

mod limiter;
mod sweeper;
mod window;

pub use limiter::RateLimiter;
pub use sweeper::spawn_sweeper;
pub use window::ClientWindow;
