pub mod lease_repo;
