mod audit_test;
mod revocation_test;
mod metastore_failure_test;
