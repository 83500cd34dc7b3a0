use crate::model::entity::{EntityDef, PropertyType};
use crate::model::pivot::PivotSchema;
use crate::model::registry::{Registry, TableDef};

/// Users in one table, privileges grouped and shared by every user type.
pub fn privilege_registry() -> Registry {
    Registry::new()
        .with(
            EntityDef::new("User")
                .discriminator("type")
                .property("name", PropertyType::Text)
                .unique("email", PropertyType::Text)
                .many_to_many("privileges", "Privilege"),
        )
        .with(EntityDef::new("SuperUser").extends("User").many_to_many("privileges", "Privilege"))
        .with(EntityDef::new("AdminUser").extends("User").many_to_many("privileges", "Privilege"))
        .with(
            EntityDef::new("Privilege")
                .property("name", PropertyType::Text)
                .many_to_many_mapped_by("users", "User", "privileges")
                .many_to_one("group", "PrivilegeGroup"),
        )
        .with(
            EntityDef::new("PrivilegeGroup")
                .property("name", PropertyType::Text)
                .one_to_many("privileges", "Privilege", "group"),
        )
}

pub fn user_table() -> TableDef {
    let metadata = privilege_registry().finalize().expect("fixture registry is valid");
    metadata.table_of("User").expect("User is registered").clone()
}

pub fn privilege_pivot() -> PivotSchema {
    PivotSchema {
        table: "privilege_user".to_string(),
        owner_column: "user_id".to_string(),
        target_column: "privilege_id".to_string(),
    }
}
