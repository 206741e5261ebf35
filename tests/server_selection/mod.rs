mod properties;
mod replica_set_with_primary;
mod unknown;
