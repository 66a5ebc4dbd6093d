//! In-process broker: connection registry and topic router.

pub mod registry;
pub mod router;

pub use registry::ConnectionRegistry;
pub use router::{DeliverySink, PublishReport, TopicRouter};
