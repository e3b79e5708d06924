mod middleware;
mod public;

pub use public::{RouterState, build_router};
