mod apm;
mod monitor;
mod session;
mod wire_protocol;
