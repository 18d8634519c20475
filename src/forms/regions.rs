use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use serde_json::{json, Value};

/// Fields every region table must provide before it is accepted
const REQUIRED_FIELDS: &[&str] = &[
    "first_name",
    "last_name",
    "email_domain",
    "phone",
    "street",
    "city",
    "state",
    "postal_code",
    "gender",
    "password",
    "search_term",
];

/// One region's candidate values per field.
///
/// `city`, `state` and `postal_code` are index-aligned so a generated persona
/// gets a geographically consistent address.
#[derive(Debug, Clone)]
pub struct RegionTable {
    name: String,
    fields: HashMap<String, Vec<String>>,
}

impl RegionTable {
    /// Load one of the built-in region tables
    pub fn builtin(region: &str) -> Result<Self> {
        let (name, value) = match region.to_ascii_lowercase().as_str() {
            "india" => ("india", india_table()),
            "usa" => ("usa", usa_table()),
            other => bail!("unknown form region: {other} (expected india or usa)"),
        };
        Self::from_value(name, value)
    }

    /// Build a table from JSON, rejecting anything that misses a required
    /// field or carries an empty candidate list
    pub fn from_value(name: &str, value: Value) -> Result<Self> {
        let object = value
            .as_object()
            .context(format!("region table '{name}' must be a JSON object"))?;

        let mut fields = HashMap::new();
        for (field, candidates) in object {
            let list = candidates
                .as_array()
                .context(format!("field '{field}' in region '{name}' must be an array"))?
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(|s| s.to_string())
                        .context(format!("field '{field}' in region '{name}' has a non-string entry"))
                })
                .collect::<Result<Vec<String>>>()?;
            fields.insert(field.clone(), list);
        }

        let table = Self {
            name: name.to_string(),
            fields,
        };
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<()> {
        for required in REQUIRED_FIELDS {
            match self.fields.get(*required) {
                None => bail!("region '{}' is missing field '{required}'", self.name),
                Some(list) if list.is_empty() => {
                    bail!("region '{}' has no candidates for '{required}'", self.name)
                }
                Some(_) => {}
            }
        }

        let cities = self.fields["city"].len();
        if self.fields["state"].len() != cities || self.fields["postal_code"].len() != cities {
            bail!(
                "region '{}': city, state and postal_code must be index-aligned",
                self.name
            );
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn candidates(&self, field: &str) -> &[String] {
        self.fields.get(field).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Random candidate for a field, empty string when the field is unknown
    pub fn pick(&self, field: &str) -> String {
        self.candidates(field)
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default()
    }

    /// Random index valid for the aligned address fields
    pub fn address_index(&self) -> usize {
        use rand::Rng;
        rand::thread_rng().gen_range(0..self.fields["city"].len())
    }
}

fn india_table() -> Value {
    json!({
        "first_name": ["Raj", "Priya", "Amit", "Shreya", "Mohammed", "Ananya", "Vikram", "Deepika", "Sanjay", "Kavita"],
        "last_name": ["Kumar", "Sharma", "Patel", "Singh", "Khan", "Reddy", "Gupta", "Iyer", "Desai", "Nair"],
        "email_domain": ["gmail.com", "yahoo.com", "outlook.com", "example.com"],
        "phone": ["+91 9876543210", "+91 8765432109", "+91 7654321098", "9876543210"],
        "street": ["123 MG Road", "45 Nehru Street", "78 Gandhi Nagar", "Flat 101, Sunrise Apartments", "H.No. 123, Sector 15"],
        "city": ["Mumbai", "Delhi", "Bangalore", "Hyderabad", "Chennai", "Kolkata", "Pune", "Ahmedabad", "Jaipur", "Lucknow"],
        "state": ["Maharashtra", "Delhi", "Karnataka", "Telangana", "Tamil Nadu", "West Bengal", "Gujarat", "Rajasthan", "Uttar Pradesh", "Kerala"],
        "postal_code": ["400001", "110001", "560001", "500001", "600001", "700001", "411001", "380001", "302001", "226001"],
        "country": ["India"],
        "gender": ["Male", "Female", "Other"],
        "password": ["SecurePass@123", "India2023#", "MyP@ssw0rd!", "Str0ng!Pass"],
        "search_term": ["best smartphone", "restaurants near me", "cheap flights", "online courses", "laptop", "camera", "headphones", "coffee maker", "hotel booking", "fitness tracker"],
        "comment": ["This is a great product!", "Looking forward to your response", "Please share more details"]
    })
}

fn usa_table() -> Value {
    json!({
        "first_name": ["John", "Sarah", "Michael", "Jennifer", "David", "Lisa", "Robert", "Emily", "Thomas", "Jessica"],
        "last_name": ["Smith", "Johnson", "Williams", "Brown", "Jones", "Garcia", "Miller", "Davis", "Wilson", "Anderson"],
        "email_domain": ["gmail.com", "yahoo.com", "outlook.com", "example.com"],
        "phone": ["+1 555-123-4567", "+1 555-987-6543", "555-234-5678", "(555) 345-6789"],
        "street": ["123 Main Street", "45 Oak Avenue", "78 Maple Drive", "Apt 4B, 910 Park Place", "567 Washington Blvd"],
        "city": ["New York", "Los Angeles", "Chicago", "Houston", "Phoenix", "Philadelphia", "San Antonio", "San Diego", "Dallas", "Seattle"],
        "state": ["New York", "California", "Illinois", "Texas", "Arizona", "Pennsylvania", "Texas", "California", "Texas", "Washington"],
        "postal_code": ["10001", "90001", "60601", "77001", "85001", "19101", "78201", "92101", "75201", "98101"],
        "country": ["United States"],
        "gender": ["Male", "Female", "Other"],
        "password": ["SecurePass@123", "Summer2023#", "MyP@ssw0rd!", "Str0ng!Pass"],
        "search_term": ["best smartphone", "restaurants near me", "cheap flights", "online courses", "laptop", "camera", "headphones", "coffee maker", "hotel booking", "fitness tracker"],
        "comment": ["This is a great product!", "Looking forward to your response", "Please share more details"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tables_pass_validation() {
        for region in ["india", "usa"] {
            let table = RegionTable::builtin(region).unwrap();
            assert_eq!(table.name(), region);
            assert!(!table.candidates("first_name").is_empty());
        }
    }

    #[test]
    fn unknown_region_is_rejected() {
        assert!(RegionTable::builtin("atlantis").is_err());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut value = india_table();
        value.as_object_mut().unwrap().remove("phone");
        let err = RegionTable::from_value("india", value).unwrap_err();
        assert!(err.to_string().contains("phone"));
    }

    #[test]
    fn misaligned_address_fields_are_rejected() {
        let mut value = india_table();
        value
            .as_object_mut()
            .unwrap()
            .insert("postal_code".into(), json!(["400001"]));
        assert!(RegionTable::from_value("india", value).is_err());
    }
}
