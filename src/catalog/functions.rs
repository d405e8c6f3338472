//! Builtin scalar and aggregate function seeding.
//!
//! The function registry proper (signatures, dispatch, vector kernels) lives
//! outside the storage engine; bring-up only has to make sure the catalog
//! knows the builtin names exactly once so that replayed metadata referring
//! to them resolves. Seeding is idempotent — replica bring-up runs it on a
//! catalog that was already populated by log replay.

use super::Catalog;

/// Names registered into every catalog at bring-up.
pub(crate) const BUILTIN_FUNCTIONS: &[&str] = &[
    "abs",
    "avg",
    "ceil",
    "char_length",
    "cosine_distance",
    "count",
    "floor",
    "inner_product",
    "l2_distance",
    "lower",
    "max",
    "min",
    "round",
    "substring",
    "sum",
    "trim",
    "upper",
];

/// Seeds the builtin function names into `catalog`.
pub fn seed_builtin_functions(catalog: &Catalog) {
    for name in BUILTIN_FUNCTIONS {
        catalog.register_function(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_is_idempotent() {
        let catalog = Catalog::new();
        seed_builtin_functions(&catalog);
        let first = catalog.function_count();
        seed_builtin_functions(&catalog);
        assert_eq!(catalog.function_count(), first);
        assert!(catalog.has_function("l2_distance"));
    }
}
