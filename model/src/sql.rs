//! Relational storage for the data model.
//!
//! The [`db`] module defines an abstract interface to a SQL database, with instantiations for
//! PostgreSQL and for a simple in-memory database.

pub mod db;
