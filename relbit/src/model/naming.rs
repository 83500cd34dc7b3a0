//! Physical naming conventions.
//!
//! Pivot tables join the two side identifiers in ascending lexicographic order, so the
//! name does not depend on which side declares or resolves the relationship.

use convert_case::{Case, Casing};

pub fn snake_case(identifier: &str) -> String {
    identifier.to_case(Case::Snake)
}

/// Table of an inheritance root.
pub fn entity_table(root: &str) -> String {
    snake_case(root)
}

pub fn join_column(identifier: &str) -> String {
    format!("{}_id", snake_case(identifier))
}

pub fn pivot_table(owner: &str, target: &str) -> String {
    let (a, b) = (snake_case(owner), snake_case(target));
    if a <= b {
        format!("{a}_{b}")
    } else {
        format!("{b}_{a}")
    }
}

/// Owner and target column of a pivot; a self-referential pivot numbers both sides.
pub fn pivot_columns(owner: &str, target: &str) -> (String, String) {
    let (owner_id, target_id) = (snake_case(owner), snake_case(target));
    if owner_id == target_id {
        (format!("{owner_id}_1_id"), format!("{target_id}_2_id"))
    } else {
        (join_column(owner), join_column(target))
    }
}

pub fn discriminator_value(entity: &str) -> String {
    snake_case(entity)
}

#[cfg(all(test, not(feature = "integration")))]
mod tests {
    use super::*;

    #[test]
    fn snake_case_splits_camel_words() {
        assert_eq!(snake_case("SuperUser"), "super_user");
        assert_eq!(snake_case("PrivilegeGroup"), "privilege_group");
        assert_eq!(snake_case("User"), "user");
    }

    #[test]
    fn pivot_table_is_order_independent() {
        assert_eq!(pivot_table("User", "Privilege"), "privilege_user");
        assert_eq!(pivot_table("Privilege", "User"), "privilege_user");
        assert_eq!(pivot_table("User", "User"), "user_user");
    }

    #[test]
    fn pivot_columns_follow_direction() {
        assert_eq!(pivot_columns("User", "Privilege"), ("user_id".to_string(), "privilege_id".to_string()));
        assert_eq!(pivot_columns("User", "User"), ("user_1_id".to_string(), "user_2_id".to_string()));
    }
}
