mod media;
mod models;
mod session;
mod store;
mod util;

pub use media::*;
pub use models::*;
pub use session::*;
pub use store::*;
