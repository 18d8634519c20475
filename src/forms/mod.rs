pub mod regions;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cli::config::FormSettings;
use crate::crawler::element::ElementDescriptor;

pub use regions::RegionTable;

/// One internally consistent persona used for every form on a domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub full_name: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub username: String,
    pub password: String,
    pub street: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
    pub birthdate: String,
    pub age: String,
    pub gender: String,
}

impl PersonaProfile {
    /// Generate a profile from a region table. Name, email and username are
    /// derived from each other; the address fields share one index so they
    /// stay geographically consistent.
    pub fn generate(table: &RegionTable) -> Self {
        let mut rng = rand::thread_rng();

        let first_name = table.pick("first_name");
        let last_name = table.pick("last_name");
        let full_name = format!("{first_name} {last_name}");

        let email = format!(
            "{}.{}@{}",
            first_name.to_lowercase(),
            last_name.to_lowercase(),
            table.pick("email_domain")
        );
        let username = format!(
            "{}{}{}",
            first_name.to_lowercase(),
            last_name.to_lowercase(),
            rng.gen_range(1..1000)
        );

        let idx = table.address_index();
        let city = table.candidates("city")[idx].clone();
        let state = table.candidates("state")[idx].clone();
        let postal_code = table.candidates("postal_code")[idx].clone();

        let birth_year = rng.gen_range(1970..2000);
        let birth_month = rng.gen_range(1..=12);
        let birth_day = rng.gen_range(1..=28);
        let birthdate = format!("{birth_day:02}/{birth_month:02}/{birth_year}");
        let age = (2024 - birth_year).to_string();

        Self {
            full_name,
            first_name,
            last_name,
            email,
            phone: table.pick("phone"),
            username,
            password: table.pick("password"),
            street: table.pick("street"),
            city,
            state,
            postal_code,
            country: table.pick("country"),
            birthdate,
            age,
            gender: table.pick("gender"),
        }
    }
}

/// Chooses what to type into a field based on its attributes.
///
/// One persona per provider keeps related fields consistent across a whole
/// domain (the same name, email and address everywhere).
pub struct FormValueProvider {
    profile: PersonaProfile,
    table: RegionTable,
}

/// True when the context mentions any of the terms
fn matches_any(context: &str, terms: &[&str]) -> bool {
    terms.iter().any(|term| context.contains(term))
}

impl FormValueProvider {
    pub fn new(config: &FormSettings) -> Result<Self> {
        let table = RegionTable::builtin(&config.region)?;

        let profile = match &config.profiles_file {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .context(format!("Failed to read profiles file: {}", path.display()))?;
                let profiles: Vec<PersonaProfile> = serde_json::from_str(&contents)
                    .context(format!("Failed to parse profiles file: {}", path.display()))?;
                profiles
                    .choose(&mut rand::thread_rng())
                    .cloned()
                    .context("profiles file contains no profiles")?
            }
            None => PersonaProfile::generate(&table),
        };

        info!(region = %table.name(), persona = %profile.full_name, "form value provider ready");
        Ok(Self { profile, table })
    }

    pub fn with_profile(table: RegionTable, profile: PersonaProfile) -> Self {
        Self { profile, table }
    }

    pub fn profile(&self) -> &PersonaProfile {
        &self.profile
    }

    /// Pick a value for a fillable element from its id, name, type,
    /// placeholder, class and aria-label.
    pub fn determine_value(&self, element: &ElementDescriptor) -> String {
        let context = ["id", "name", "placeholder", "class", "aria-label", "title"]
            .iter()
            .filter_map(|attr| element.attribute(attr))
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
            .replace(['_', '-'], " ");
        let input_type = element
            .attribute("type")
            .unwrap_or("text")
            .to_ascii_lowercase();

        // Typed fields first, they are unambiguous
        if input_type == "email" {
            return self.profile.email.clone();
        }
        if input_type == "password" {
            return self.profile.password.clone();
        }
        if input_type == "tel" {
            return self.profile.phone.clone();
        }

        if matches_any(&context, &["search", "query", "find", "lookup"]) {
            return self.table.pick("search_term");
        }
        // "fullname" contains "lname", so full-name terms must win first
        if matches_any(&context, &["full name", "fullname", "complete name", "your name"]) {
            return self.profile.full_name.clone();
        }
        if matches_any(&context, &["first name", "firstname", "fname", "given name"]) {
            return self.profile.first_name.clone();
        }
        if matches_any(&context, &["last name", "lastname", "lname", "surname", "family name"]) {
            return self.profile.last_name.clone();
        }
        if matches_any(&context, &["email", "e mail", "mail"]) {
            return self.profile.email.clone();
        }
        if matches_any(&context, &["phone", "mobile", "cell", "tel", "whatsapp"]) {
            return self.profile.phone.clone();
        }
        if matches_any(&context, &["username", "user name", "login id", "loginid"]) {
            return self.profile.username.clone();
        }
        if matches_any(&context, &["password", "pwd"]) {
            return self.profile.password.clone();
        }
        if matches_any(&context, &["birth", "dob"]) {
            return self.profile.birthdate.clone();
        }
        if matches_any(&context, &["comment", "message", "feedback", "review"]) {
            return self.table.pick("comment");
        }
        if matches_any(&context, &["age", "years old"]) {
            return self.profile.age.clone();
        }
        if matches_any(&context, &["gender", "sex"]) {
            return self.profile.gender.clone();
        }
        if matches_any(&context, &["zip", "pincode", "pin code", "postal"]) {
            return self.profile.postal_code.clone();
        }
        if matches_any(&context, &["city", "town"]) {
            return self.profile.city.clone();
        }
        if matches_any(&context, &["state", "province"]) {
            return self.profile.state.clone();
        }
        if matches_any(&context, &["country"]) {
            return self.profile.country.clone();
        }
        if matches_any(&context, &["address", "street"]) {
            return self.profile.street.clone();
        }
        if matches_any(&context, &["name"]) {
            return self.profile.full_name.clone();
        }

        // Nothing recognizable; a search term is the most neutral input
        self.table.pick("search_term")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::element::{InteractionVerb, SuggestedInteraction};
    use std::collections::HashMap;

    fn provider() -> FormValueProvider {
        let config = FormSettings {
            region: "india".to_string(),
            variety: "default".to_string(),
            profiles_file: None,
        };
        FormValueProvider::new(&config).unwrap()
    }

    fn input(attrs: &[(&str, &str)]) -> ElementDescriptor {
        ElementDescriptor {
            element_path: "/html/body/input[1]".to_string(),
            tag_name: "input".to_string(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            interaction: SuggestedInteraction {
                action: InteractionVerb::Fill,
            },
        }
    }

    #[test]
    fn typed_fields_win_over_context() {
        let p = provider();
        let el = input(&[("type", "email"), ("name", "search")]);
        assert_eq!(p.determine_value(&el), p.profile().email);
    }

    #[test]
    fn search_boxes_get_a_search_term() {
        let p = provider();
        let el = input(&[("name", "q"), ("placeholder", "Search products")]);
        let value = p.determine_value(&el);
        assert!(p.table.candidates("search_term").contains(&value));
    }

    #[test]
    fn name_fields_resolve_to_profile_parts() {
        let p = provider();
        assert_eq!(
            p.determine_value(&input(&[("name", "first_name")])),
            p.profile().first_name
        );
        assert_eq!(
            p.determine_value(&input(&[("name", "surname")])),
            p.profile().last_name
        );
        assert_eq!(
            p.determine_value(&input(&[("id", "fullName")])),
            p.profile().full_name
        );
        // The lname shorthand still resolves on its own
        assert_eq!(
            p.determine_value(&input(&[("name", "lname")])),
            p.profile().last_name
        );
    }

    #[test]
    fn generated_profile_is_internally_consistent() {
        let table = RegionTable::builtin("usa").unwrap();
        let profile = PersonaProfile::generate(&table);
        assert!(profile.full_name.starts_with(&profile.first_name));
        assert!(profile.email.contains(&profile.last_name.to_lowercase()));
        let idx = table
            .candidates("city")
            .iter()
            .position(|c| c == &profile.city)
            .unwrap();
        assert_eq!(table.candidates("state")[idx], profile.state);
        assert_eq!(table.candidates("postal_code")[idx], profile.postal_code);
    }
}
