pub mod password_store;
