//! Minimal changeset between two versions of the same entity tree.
//!
//! Scalar fields are compared under a normalized equality that treats a
//! one-element list `[v]` as equal to the bare value `v`. Child collections
//! are keyed by identifier, never by position. Empty `created` / `updated` /
//! `deleted` buckets are omitted at every level, so diffing a tree against
//! itself yields `{}`.
//!
//! Serialized shape of an update record: `identifier`, then the changed
//! fields inline, then `erased` (if any), then one `ListDiff` per child
//! collection that changed (`units`, `images`). Because these share one JSON
//! object, no entity field may be named after them (see [`RESERVED_FIELDS`]).

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::entity::{Fields, Image, Property, Unit};

pub const UNITS: &str = "units";
pub const IMAGES: &str = "images";

/// Keys the serialized diff uses itself; entity fields may not take them.
pub const RESERVED_FIELDS: [&str; 4] = ["identifier", "erased", UNITS, IMAGES];

#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error("cannot diff entity {old} against {new}: identifiers differ")]
    MismatchedIdentifiers { old: String, new: String },

    #[error("duplicate identifier {identifier} in {collection}")]
    DuplicateIdentifier {
        collection: &'static str,
        identifier: String,
    },

    #[error("entity {identifier} has a field named {field}, which is reserved")]
    ReservedField { identifier: String, field: String },

    #[error("failed to materialize created entity: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Changes to one entity: changed fields, erased field names, nested list diffs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diff {
    #[serde(flatten)]
    pub changed: Fields,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub erased: Vec<String>,
    #[serde(flatten)]
    pub children: BTreeMap<String, ListDiff>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.erased.is_empty() && self.children.is_empty()
    }
}

/// Partial record for an entity present on both sides with real changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityUpdate {
    pub identifier: String,
    #[serde(flatten)]
    pub changes: Diff,
}

/// Created / updated / deleted buckets for one keyed child collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListDiff {
    /// Entities new in this version, fully materialized.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub created: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updated: Vec<EntityUpdate>,
    /// Bare identifiers of entities gone from this version.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<String>,
}

impl ListDiff {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// A node in an entity tree the engine knows how to compare.
pub trait Diffable: Serialize + Sized {
    fn identifier(&self) -> &str;
    fn fields(&self) -> &Fields;

    /// Diff every keyed child collection, returning only the non-empty ones.
    fn diff_children(old: &Self, new: &Self) -> Result<BTreeMap<String, ListDiff>, DiffError>;

    /// Reject reserved field names in this entity and all of its children.
    fn check_fields(&self) -> Result<(), DiffError> {
        check_reserved(self.identifier(), self.fields())
    }
}

impl Diffable for Image {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn diff_children(_old: &Self, _new: &Self) -> Result<BTreeMap<String, ListDiff>, DiffError> {
        Ok(BTreeMap::new())
    }
}

impl Diffable for Unit {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn diff_children(old: &Self, new: &Self) -> Result<BTreeMap<String, ListDiff>, DiffError> {
        let mut children = BTreeMap::new();
        insert_non_empty(&mut children, IMAGES, diff_list(IMAGES, &old.images, &new.images)?);
        Ok(children)
    }

    fn check_fields(&self) -> Result<(), DiffError> {
        check_reserved(&self.identifier, &self.fields)?;
        self.images.iter().try_for_each(|child| child.check_fields())
    }
}

impl Diffable for Property {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn fields(&self) -> &Fields {
        &self.fields
    }

    fn diff_children(old: &Self, new: &Self) -> Result<BTreeMap<String, ListDiff>, DiffError> {
        let mut children = BTreeMap::new();
        insert_non_empty(&mut children, UNITS, diff_list(UNITS, &old.units, &new.units)?);
        insert_non_empty(&mut children, IMAGES, diff_list(IMAGES, &old.images, &new.images)?);
        Ok(children)
    }

    fn check_fields(&self) -> Result<(), DiffError> {
        check_reserved(&self.identifier, &self.fields)?;
        self.units.iter().try_for_each(|child| child.check_fields())?;
        self.images.iter().try_for_each(|child| child.check_fields())
    }
}

/// Compute the changeset between two versions of the same entity.
///
/// Both sides must carry the same identifier; anything else is a caller bug
/// and fails with [`DiffError::MismatchedIdentifiers`]. A field named after
/// one of [`RESERVED_FIELDS`] fails with [`DiffError::ReservedField`].
pub fn diff<T: Diffable>(old: &T, new: &T) -> Result<Diff, DiffError> {
    if old.identifier() != new.identifier() {
        return Err(DiffError::MismatchedIdentifiers {
            old: old.identifier().to_string(),
            new: new.identifier().to_string(),
        });
    }
    diff_entity(old, new)
}

/// Diff a keyed collection.
///
/// `created` and `updated` follow the order of `new`; `deleted` follows the
/// order of `old`.
pub fn diff_list<T: Diffable>(
    collection: &'static str,
    old: &[T],
    new: &[T],
) -> Result<ListDiff, DiffError> {
    let old_index = index_by_identifier(collection, old)?;
    let new_index = index_by_identifier(collection, new)?;

    let mut out = ListDiff::default();

    for entity in new {
        match old_index.get(entity.identifier()) {
            None => {
                entity.check_fields()?;
                out.created.push(serde_json::to_value(entity)?);
            }
            Some(previous) => {
                let changes = diff_entity(*previous, entity)?;
                if !changes.is_empty() {
                    out.updated.push(EntityUpdate {
                        identifier: entity.identifier().to_string(),
                        changes,
                    });
                }
            }
        }
    }

    for entity in old {
        if !new_index.contains_key(entity.identifier()) {
            out.deleted.push(entity.identifier().to_string());
        }
    }

    Ok(out)
}

fn diff_entity<T: Diffable>(old: &T, new: &T) -> Result<Diff, DiffError> {
    check_reserved(old.identifier(), old.fields())?;
    check_reserved(new.identifier(), new.fields())?;
    let (changed, erased) = diff_fields(old.fields(), new.fields());
    Ok(Diff {
        changed,
        erased,
        children: T::diff_children(old, new)?,
    })
}

/// Changed fields (with their new values) and erased field names.
fn diff_fields(old: &Fields, new: &Fields) -> (Fields, Vec<String>) {
    let mut changed = Fields::new();
    for (name, value) in new {
        if value.is_null() {
            continue;
        }
        let unchanged = old
            .get(name)
            .is_some_and(|previous| normalized_eq(previous, value));
        if !unchanged {
            changed.insert(name.clone(), value.clone());
        }
    }

    let erased = old
        .iter()
        .filter(|(name, previous)| {
            !previous.is_null() && new.get(name.as_str()).map_or(true, Value::is_null)
        })
        .map(|(name, _)| name.clone())
        .collect();

    (changed, erased)
}

fn check_reserved(identifier: &str, fields: &Fields) -> Result<(), DiffError> {
    match RESERVED_FIELDS.iter().find(|name| fields.contains_key(**name)) {
        Some(field) => Err(DiffError::ReservedField {
            identifier: identifier.to_string(),
            field: field.to_string(),
        }),
        None => Ok(()),
    }
}

/// Equality that ignores the difference between `v` and `[v]`.
pub fn normalized_eq(a: &Value, b: &Value) -> bool {
    unwrap_singleton(a) == unwrap_singleton(b)
}

fn unwrap_singleton(value: &Value) -> &Value {
    match value {
        Value::Array(items) if items.len() == 1 => &items[0],
        _ => value,
    }
}

fn index_by_identifier<'a, T: Diffable>(
    collection: &'static str,
    entities: &'a [T],
) -> Result<HashMap<&'a str, &'a T>, DiffError> {
    let mut index = HashMap::with_capacity(entities.len());
    for entity in entities {
        if index.insert(entity.identifier(), entity).is_some() {
            return Err(DiffError::DuplicateIdentifier {
                collection,
                identifier: entity.identifier().to_string(),
            });
        }
    }
    Ok(index)
}

fn insert_non_empty(children: &mut BTreeMap<String, ListDiff>, name: &str, list: ListDiff) {
    if !list.is_empty() {
        children.insert(name.to_string(), list);
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn image(id: &str, caption: Option<&str>) -> Image {
        let image = Image::new(id).with("url", format!("https://cdn.example/{id}.jpg"));
        match caption {
            Some(caption) => image.with("caption", caption),
            None => image.with("caption", Value::Null),
        }
    }

    fn sample_property() -> Property {
        Property::new("p1")
            .with("name", "Casa Azul")
            .with("amenities", "pool,wifi")
            .with("bedrooms", 3)
            .with_images(vec![image("img1", Some("Front"))])
            .with_units(vec![
                Unit::new("u1")
                    .with("max_guests", 4)
                    .with_images(vec![image("u1-img1", Some("Bedroom"))]),
                Unit::new("u2").with("max_guests", 2),
            ])
    }

    fn to_json(diff: &Diff) -> Value {
        serde_json::to_value(diff).unwrap()
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let property = sample_property();
        let result = diff(&property, &property.clone()).unwrap();
        assert!(result.is_empty());
        assert_eq!(to_json(&result), json!({}));
    }

    #[test]
    fn test_image_scenario() {
        let old = vec![
            image("img1", Some("Swimming Pool")),
            image("img2", Some("Barbecue Pit")),
            image("img3", Some("Meeting Room")),
            image("img4", Some("Entrance")),
            image("img5", None),
        ];
        let new = vec![
            image("img1", Some("Swimming Pool, with set of chairs")),
            image("img2", Some("Barbecue Pit")),
            image("img5", Some("Customer Service")),
            image("img6", Some("Foosball Table")),
        ];

        let result = diff_list(IMAGES, &old, &new).unwrap();
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "created": [{
                    "identifier": "img6",
                    "url": "https://cdn.example/img6.jpg",
                    "caption": "Foosball Table"
                }],
                "updated": [
                    {"identifier": "img1", "caption": "Swimming Pool, with set of chairs"},
                    {"identifier": "img5", "caption": "Customer Service"}
                ],
                "deleted": ["img3", "img4"]
            })
        );
    }

    #[test]
    fn test_singleton_list_equals_scalar() {
        let old = Property::new("p1").with("amenities", "pool,wifi");
        let new = Property::new("p1").with("amenities", json!(["pool,wifi"]));
        assert!(diff(&old, &new).unwrap().is_empty());
        assert!(diff(&new, &old).unwrap().is_empty());
    }

    #[test]
    fn test_multi_element_list_is_not_scalar() {
        let old = Property::new("p1").with("amenities", "pool,wifi");
        let new = Property::new("p1").with("amenities", json!(["pool", "wifi"]));
        let result = diff(&old, &new).unwrap();
        assert_eq!(result.changed.get("amenities"), Some(&json!(["pool", "wifi"])));
    }

    #[test]
    fn test_erased_fields_recorded_separately() {
        let old = Property::new("p1")
            .with("name", "Casa Azul")
            .with("license", "HUT-123")
            .with("wifi_code", "secret")
            .with("notes", Value::Null);
        let new = Property::new("p1")
            .with("name", "Casa Azul")
            .with("license", Value::Null);

        let result = diff(&old, &new).unwrap();
        assert!(result.changed.is_empty());
        assert_eq!(result.erased, vec!["license", "wifi_code"]);
        assert_eq!(to_json(&result), json!({"erased": ["license", "wifi_code"]}));
    }

    #[test]
    fn test_new_field_counts_as_changed() {
        let old = Property::new("p1");
        let new = Property::new("p1").with("bedrooms", 2);
        assert_eq!(to_json(&diff(&old, &new).unwrap()), json!({"bedrooms": 2}));
    }

    #[test]
    fn test_nested_unit_image_change_only() {
        let old = sample_property();
        let mut new = sample_property();
        new.units[0].images[0]
            .fields
            .insert("caption".into(), json!("Master bedroom"));

        let result = diff(&old, &new).unwrap();
        assert_eq!(
            to_json(&result),
            json!({
                "units": {
                    "updated": [{
                        "identifier": "u1",
                        "images": {
                            "updated": [{"identifier": "u1-img1", "caption": "Master bedroom"}]
                        }
                    }]
                }
            })
        );
    }

    #[test]
    fn test_created_unit_is_fully_materialized() {
        let old = sample_property();
        let mut new = sample_property();
        new.units.push(
            Unit::new("u3")
                .with("max_guests", 6)
                .with_images(vec![image("u3-img1", Some("Terrace"))]),
        );

        let result = diff(&old, &new).unwrap();
        let units = &result.children[UNITS];
        assert!(units.updated.is_empty());
        assert!(units.deleted.is_empty());
        assert_eq!(
            units.created,
            vec![json!({
                "identifier": "u3",
                "max_guests": 6,
                "images": [{
                    "identifier": "u3-img1",
                    "url": "https://cdn.example/u3-img1.jpg",
                    "caption": "Terrace"
                }]
            })]
        );
    }

    #[test]
    fn test_deleted_unit_is_bare_identifier() {
        let old = sample_property();
        let mut new = sample_property();
        new.units.remove(0);

        let result = diff(&old, &new).unwrap();
        assert_eq!(to_json(&result), json!({"units": {"deleted": ["u1"]}}));
    }

    #[test]
    fn test_reordering_is_not_a_change() {
        let old = sample_property();
        let mut new = sample_property();
        new.units.reverse();
        assert!(diff(&old, &new).unwrap().is_empty());
    }

    #[test]
    fn test_mismatched_identifiers_fail() {
        let err = diff(&Property::new("p1"), &Property::new("p2")).unwrap_err();
        assert!(matches!(err, DiffError::MismatchedIdentifiers { .. }));
    }

    #[test]
    fn test_duplicate_identifier_fails() {
        let old = vec![Image::new("img1")];
        let new = vec![Image::new("img1"), Image::new("img1")];
        let err = diff_list(IMAGES, &old, &new).unwrap_err();
        assert!(matches!(
            err,
            DiffError::DuplicateIdentifier { collection: IMAGES, .. }
        ));
    }

    #[test]
    fn test_field_named_like_a_diff_key_fails() {
        let old = Property::new("p1");
        for field in ["erased", "units", "identifier"] {
            let new = Property::new("p1").with(field, "x");
            let err = diff(&old, &new).unwrap_err();
            match err {
                DiffError::ReservedField {
                    identifier,
                    field: rejected,
                } => {
                    assert_eq!(identifier, "p1");
                    assert_eq!(rejected, field);
                }
                other => panic!("{field}: unexpected {other}"),
            }
        }
    }

    #[test]
    fn test_reserved_field_in_created_child_fails() {
        let old = sample_property();
        let mut new = sample_property();
        new.units
            .push(Unit::new("u3").with_images(vec![Image::new("u3-img1").with("images", "[]")]));

        let err = diff(&old, &new).unwrap_err();
        assert_eq!(
            err.to_string(),
            "entity u3-img1 has a field named images, which is reserved"
        );
    }

    #[test]
    fn test_top_level_and_nested_changes_together() {
        let old = sample_property();
        let mut new = sample_property().with("bedrooms", 4);
        new.images.push(image("img2", Some("Garden")));
        new.units[1].fields.remove("max_guests");

        let result = diff(&old, &new).unwrap();
        assert_eq!(
            to_json(&result),
            json!({
                "bedrooms": 4,
                "images": {
                    "created": [{
                        "identifier": "img2",
                        "url": "https://cdn.example/img2.jpg",
                        "caption": "Garden"
                    }]
                },
                "units": {
                    "updated": [{"identifier": "u2", "erased": ["max_guests"]}]
                }
            })
        );
    }
}
