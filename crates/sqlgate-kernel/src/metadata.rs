use sqlgate_contracts::Intent;

use crate::registry::AllowlistRegistry;

const STEM_CHARS: usize = 5;

/// Schema context handed to the answer step or the synthesizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataCandidates {
    pub tables: Vec<String>,
    pub columns: Vec<String>,
}

impl MetadataCandidates {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Looks up candidate relations and columns in the allow-list.
///
/// With a canonical relation every request is answered from that one
/// relation. Without one the whole registry is offered, ranked so that a
/// relation named in the message comes first.
#[derive(Debug, Clone, Default)]
pub struct MetadataResolver {
    canonical_relation: Option<String>,
}

impl MetadataResolver {
    pub fn new(canonical_relation: Option<String>) -> Self {
        Self {
            canonical_relation: canonical_relation
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty()),
        }
    }

    pub fn canonical_relation(&self) -> Option<&str> {
        self.canonical_relation.as_deref()
    }

    pub fn resolve(
        &self,
        registry: &AllowlistRegistry,
        intent: Intent,
        message: &str,
    ) -> MetadataCandidates {
        if registry.is_empty() {
            return MetadataCandidates::default();
        }

        if let Some(canonical) = &self.canonical_relation {
            return match registry.columns_of(canonical) {
                Ok(columns) => MetadataCandidates {
                    tables: vec![canonical.clone()],
                    columns: columns.to_vec(),
                },
                Err(_) => MetadataCandidates::default(),
            };
        }

        let entries = registry.entries();
        if intent == Intent::AskMetadata {
            let qualify = entries.len() > 1;
            let columns = entries
                .iter()
                .flat_map(|e| {
                    e.columns.iter().map(move |c| {
                        if qualify {
                            format!("{}.{c}", e.relation)
                        } else {
                            c.clone()
                        }
                    })
                })
                .collect();
            return MetadataCandidates {
                tables: registry.relations(),
                columns,
            };
        }

        let folded = fold(message);
        let mut ranked: Vec<_> = entries.iter().collect();
        // Stable sort keeps registry order among equally ranked relations.
        ranked.sort_by_key(|e| !mentions_relation(&folded, &e.relation));
        MetadataCandidates {
            tables: ranked.iter().map(|e| e.relation.clone()).collect(),
            columns: ranked[0].columns.clone(),
        }
    }
}

fn mentions_relation(folded_message: &str, relation: &str) -> bool {
    let name = relation.rsplit('.').next().unwrap_or(relation);
    let stem: String = fold(name).chars().take(STEM_CHARS).collect();
    !stem.is_empty() && folded_message.contains(&stem)
}

/// Lower-cases and strips Turkish diacritics so "Satışları" meets "satislar".
pub fn fold(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'ş' => 's',
            'ı' => 'i',
            'ğ' => 'g',
            'ü' => 'u',
            'ö' => 'o',
            'ç' => 'c',
            'â' => 'a',
            'î' => 'i',
            'û' => 'u',
            other => other,
        })
        .filter(|c| *c != '\u{307}')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AllowlistRegistry {
        AllowlistRegistry::from_json_str(
            r#"{"tables": {
                "satislar": ["id", "tarih", "tutar"],
                "musteriler": ["musteri_id", "ad"]
            }}"#,
        )
        .unwrap()
    }

    #[test]
    fn metadata_question_lists_every_relation() {
        let out = MetadataResolver::default().resolve(&registry(), Intent::AskMetadata, "Hangi tablolar var?");
        assert_eq!(out.tables, vec!["musteriler", "satislar"]);
        assert!(out.columns.contains(&"satislar.tutar".to_string()));
        assert!(out.columns.contains(&"musteriler.ad".to_string()));
    }

    #[test]
    fn generation_puts_mentioned_relation_first() {
        let out = MetadataResolver::default().resolve(
            &registry(),
            Intent::GenerateSql,
            "Son 7 günde SATIŞLARI getir",
        );
        assert_eq!(out.tables, vec!["satislar", "musteriler"]);
        assert_eq!(out.columns, vec!["id", "tarih", "tutar"]);

        let out = MetadataResolver::default().resolve(&registry(), Intent::GenerateSql, "rapor");
        assert_eq!(out.tables[0], "musteriler");
    }

    #[test]
    fn canonical_relation_restricts_resolution() {
        let resolver = MetadataResolver::new(Some("satislar".to_string()));
        for intent in [Intent::AskMetadata, Intent::GenerateSql] {
            let out = resolver.resolve(&registry(), intent, "müşteriler");
            assert_eq!(out.tables, vec!["satislar"]);
            assert_eq!(out.columns, vec!["id", "tarih", "tutar"]);
        }
    }

    #[test]
    fn empty_registry_yields_empty_lists() {
        let empty = AllowlistRegistry::default();
        for resolver in [
            MetadataResolver::default(),
            MetadataResolver::new(Some("satislar".to_string())),
        ] {
            let out = resolver.resolve(&empty, Intent::GenerateSql, "satislar");
            assert!(out.tables.is_empty());
            assert!(out.columns.is_empty());
        }
    }

    #[test]
    fn folding_handles_turkish_letters() {
        assert_eq!(fold("Satışları"), "satislari");
        assert_eq!(fold("İŞLEM Günü"), "islem gunu");
    }
}
