//! Property-Based Tests for Snapshot Determinism
//!
//! Property: for any source state, building a mirror from the live instance
//! and from the equivalent raw stored record SHALL produce byte-identical
//! JSON, including nested mirrors and absent optional relations.

use denorm_core::{
    new_entity_id, EntityId, FieldSpec, MirrorSource, MirrorSpec, ModelSchema, SnapshotBuilder,
    SnapshotSchema,
};
use proptest::prelude::*;
use serde_json::{json, Map, Value};

// ============================================================================
// SOURCE STATES
// ============================================================================

#[derive(Debug, Clone)]
struct Owner {
    id: EntityId,
    name: String,
    phone: Option<String>,
}

#[derive(Debug, Clone)]
struct House {
    id: EntityId,
    address: String,
    rooms: i64,
    owner: Option<Owner>,
}

impl MirrorSource for Owner {
    fn source_id(&self) -> EntityId {
        self.id
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "name" => Some(json!(self.name)),
            "phone" => self.phone.as_ref().map(|p| json!(p)),
            _ => None,
        }
    }

    fn related(&self, _name: &str) -> Option<&dyn MirrorSource> {
        None
    }
}

impl MirrorSource for House {
    fn source_id(&self) -> EntityId {
        self.id
    }

    fn field(&self, name: &str) -> Option<Value> {
        match name {
            "address" => Some(json!(self.address)),
            "rooms" => Some(json!(self.rooms)),
            _ => None,
        }
    }

    fn related(&self, name: &str) -> Option<&dyn MirrorSource> {
        match name {
            "owner" => self.owner.as_ref().map(|o| o as &dyn MirrorSource),
            _ => None,
        }
    }
}

/// Raw record as the document store would persist the same house.
fn house_record(house: &House) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert("_id".to_string(), json!(house.id.to_string()));
    record.insert("addr".to_string(), json!(house.address));
    record.insert("rooms".to_string(), json!(house.rooms));
    let owner = match &house.owner {
        Some(owner) => {
            let mut o = Map::new();
            o.insert("_id".to_string(), json!(owner.id.to_string()));
            o.insert("full_name".to_string(), json!(owner.name));
            if let Some(phone) = &owner.phone {
                o.insert("phone".to_string(), json!(phone));
            }
            Value::Object(o)
        }
        None => Value::Null,
    };
    record.insert("landlord".to_string(), owner);
    record
}

fn schema() -> SnapshotSchema {
    SnapshotSchema::builder()
        .mirror(
            MirrorSpec::new("OwnerMirror", "Owner")
                .field(FieldSpec::scalar("name").stored_as("full_name"))
                .field(FieldSpec::scalar("phone")),
        )
        .mirror(
            MirrorSpec::new("HouseMirror", "House")
                .field(FieldSpec::scalar("address").stored_as("addr"))
                .field(FieldSpec::scalar("rooms"))
                .field(FieldSpec::nested("owner", "OwnerMirror").stored_as("landlord")),
        )
        .model(ModelSchema::new("Tenant").mirror("house", "HouseMirror"))
        .build()
        .expect("fixture schema is valid")
}

// ============================================================================
// ARBITRATORS
// ============================================================================

fn arb_owner() -> impl Strategy<Value = Owner> {
    ("[A-Za-z ]{1,20}", proptest::option::of("[0-9]{7,10}")).prop_map(|(name, phone)| Owner {
        id: new_entity_id(),
        name,
        phone,
    })
}

fn arb_house() -> impl Strategy<Value = House> {
    (
        "[0-9]{1,4} [A-Za-z]{3,12} (St|Ave|Rd)",
        0i64..20,
        proptest::option::of(arb_owner()),
    )
        .prop_map(|(address, rooms, owner)| House {
            id: new_entity_id(),
            address,
            rooms,
            owner,
        })
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_instance_and_record_are_byte_identical(house in arb_house()) {
        let schema = schema();
        let builder = SnapshotBuilder::new(&schema);

        let from_instance = builder.from_instance("HouseMirror", &house).unwrap();
        let from_record = builder.from_record("HouseMirror", &house_record(&house)).unwrap();

        prop_assert_eq!(
            serde_json::to_vec(&from_instance).unwrap(),
            serde_json::to_vec(&from_record).unwrap()
        );
    }

    #[test]
    fn prop_mirror_carries_source_id_and_declared_fields_only(house in arb_house()) {
        let schema = schema();
        let builder = SnapshotBuilder::new(&schema);
        let mirror = builder.from_instance("HouseMirror", &house).unwrap();
        let obj = mirror.as_object().unwrap();

        prop_assert_eq!(obj.len(), 4);
        prop_assert_eq!(&obj["id"], &json!(house.id.to_string()));
        prop_assert_eq!(obj["owner"].is_null(), house.owner.is_none());
    }

    #[test]
    fn prop_building_twice_is_stable(house in arb_house()) {
        let schema = schema();
        let builder = SnapshotBuilder::new(&schema);
        let a = builder.from_instance("HouseMirror", &house).unwrap();
        let b = builder.from_instance("HouseMirror", &house).unwrap();
        prop_assert_eq!(a, b);
    }
}
