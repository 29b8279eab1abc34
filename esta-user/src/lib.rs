pub mod config;
pub mod login;

// A user is composed of 2 things:
// - An identity (login): email address, password hash, active flag
// - The mailbox state attached to it, owned by esta-store
