pub mod autodiscover;
pub mod eas;
pub mod smtp;
