use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Instance not found: {service_id}/{instance_id}")]
    InstanceNotFound {
        service_id: String,
        instance_id: String,
    },

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),
}

impl CoreError {
    pub fn instance_not_found(service_id: &str, instance_id: &str) -> Self {
        CoreError::InstanceNotFound {
            service_id: service_id.to_string(),
            instance_id: instance_id.to_string(),
        }
    }
}
