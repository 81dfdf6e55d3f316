use crate::bucket::FieldIndex;
use std::collections::BTreeMap;

/// The structural difference between a stored index map and an incoming one.
/// `add` and `del` drive column DDL; `modified` is recorded but not acted
/// on (the stored column definition wins).
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct IndexDiff {
    pub add: Vec<String>,
    pub del: Vec<String>,
    pub modified: Vec<String>,
}

impl IndexDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.del.is_empty() && self.modified.is_empty()
    }
}

/// Compute the diff between the stored and incoming index maps.
pub fn diff_index(
    old: &BTreeMap<String, FieldIndex>,
    new: &BTreeMap<String, FieldIndex>,
) -> IndexDiff {
    let mut diff = IndexDiff::default();

    for (field, incoming) in new {
        match old.get(field) {
            None => diff.add.push(field.clone()),
            Some(stored) if stored != incoming => diff.modified.push(field.clone()),
            Some(_) => (),
        }
    }
    for field in old.keys() {
        if !new.contains_key(field) {
            diff.del.push(field.clone());
        }
    }
    diff
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::IndexType;

    fn index(fields: &[(&str, IndexType, bool)]) -> BTreeMap<String, FieldIndex> {
        fields
            .iter()
            .map(|(name, ty, unique)| {
                (
                    name.to_string(),
                    FieldIndex {
                        ty: *ty,
                        unique: *unique,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn diff_cases() {
        let old = index(&[
            ("age", IndexType::Number, false),
            ("email", IndexType::String, true),
            ("tags", IndexType::StringArray, false),
        ]);
        let new = index(&[
            ("age", IndexType::Number, false),
            ("email", IndexType::String, false), // uniqueness changed
            ("name", IndexType::String, false),  // added
        ]);

        insta::assert_json_snapshot!(diff_index(&old, &new), @r###"
        {
          "add": [
            "name"
          ],
          "del": [
            "tags"
          ],
          "modified": [
            "email"
          ]
        }
        "###);
    }

    #[test]
    fn identical_maps_diff_empty() {
        let idx = index(&[("age", IndexType::Number, false)]);
        assert!(diff_index(&idx, &idx).is_empty());
    }

    #[test]
    fn type_change_is_modified() {
        let old = index(&[("age", IndexType::Number, false)]);
        let new = index(&[("age", IndexType::String, false)]);
        let diff = diff_index(&old, &new);
        assert_eq!(diff.modified, vec!["age".to_string()]);
        assert!(diff.add.is_empty() && diff.del.is_empty());
    }
}
