//! Database entities

pub mod upstream;

pub use upstream::Entity as Upstream;

pub mod prelude {
    pub use super::upstream::Entity as Upstream;
}
