use crate::metadata_db::MetadataDb;

/// Category assigned when no rule matches.
pub const FALLBACK_CATEGORY: &str = "altro";

/// Classify a dataflow by keyword rules. Rules come back from the store
/// already ordered (priority DESC, rule_id ASC), so the first rule whose
/// keyword set intersects the whitespace-tokenized input wins.
pub fn categorize_dataflow(
    db: &MetadataDb,
    name: &str,
    description: &str,
) -> anyhow::Result<String> {
    let rules = db.get_categorization_rules(None, true)?;
    let text = format!("{name} {description}").to_lowercase();
    let tokens: std::collections::HashSet<&str> = text.split_whitespace().collect();

    for rule in &rules {
        if rule.keywords.iter().any(|k| tokens.contains(k.as_str())) {
            tracing::debug!("dataflow '{name}' matched rule {} -> {}", rule.rule_id, rule.category);
            return Ok(rule.category.clone());
        }
    }
    Ok(FALLBACK_CATEGORY.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> MetadataDb {
        MetadataDb::open_in_memory().unwrap()
    }

    #[test]
    fn matches_default_rules() {
        let db = db();
        assert_eq!(
            categorize_dataflow(&db, "Popolazione residente al 1 gennaio", "").unwrap(),
            "popolazione"
        );
        assert_eq!(
            categorize_dataflow(&db, "Indice dei prezzi al consumo", "dati su inflazione").unwrap(),
            "economia"
        );
        assert_eq!(
            categorize_dataflow(&db, "Tasso di occupazione", "").unwrap(),
            "lavoro"
        );
    }

    #[test]
    fn falls_back_to_altro() {
        let db = db();
        assert_eq!(
            categorize_dataflow(&db, "Qualcosa di diverso", "senza parole chiave").unwrap(),
            FALLBACK_CATEGORY
        );
    }

    #[test]
    fn higher_priority_rule_wins() {
        let db = db();
        // "mortalita" appears in the default salute rule; a higher-priority
        // custom rule takes the match.
        db.create_categorization_rule(
            "zz_custom",
            "demografia",
            &["mortalita".to_string()],
            50,
            "",
        )
        .unwrap();
        assert_eq!(
            categorize_dataflow(&db, "Tavole di mortalita", "").unwrap(),
            "demografia"
        );
    }

    #[test]
    fn tie_breaks_by_rule_id() {
        let db = db();
        db.create_categorization_rule("b_rule", "beta", &["parola".to_string()], 99, "")
            .unwrap();
        db.create_categorization_rule("a_rule", "alfa", &["parola".to_string()], 99, "")
            .unwrap();
        assert_eq!(categorize_dataflow(&db, "una parola", "").unwrap(), "alfa");
    }

    #[test]
    fn categorization_is_deterministic() {
        let db = db();
        let first = categorize_dataflow(&db, "Occupazione e lavoro", "").unwrap();
        for _ in 0..10 {
            assert_eq!(
                categorize_dataflow(&db, "Occupazione e lavoro", "").unwrap(),
                first
            );
        }
    }
}
