mod service_publisher;

pub use service_publisher::ServicePublisher;
