use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;

use crate::plugin::manifest::PluginDescriptor;

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub marketplace: String,
    pub plugin: PluginDescriptor,
    pub score: i64,
}

/// Fuzzy-matches `query` against name, description, tags, keywords and category.
///
/// Best score first; ties ordered by marketplace then plugin name.
pub fn search(
    query: &str,
    catalog: impl IntoIterator<Item = (String, PluginDescriptor)>,
) -> Vec<SearchHit> {
    let matcher = SkimMatcherV2::default().ignore_case();
    let query = query.trim();

    let mut hits: Vec<SearchHit> = catalog
        .into_iter()
        .filter_map(|(marketplace, plugin)| {
            let score = if query.is_empty() {
                Some(0)
            } else {
                fields(&plugin)
                    .filter_map(|field| matcher.fuzzy_match(field, query))
                    .max()
            }?;
            Some(SearchHit {
                marketplace,
                plugin,
                score,
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.marketplace.cmp(&b.marketplace))
            .then_with(|| a.plugin.name.cmp(&b.plugin.name))
    });
    hits
}

fn fields(plugin: &PluginDescriptor) -> impl Iterator<Item = &str> {
    std::iter::once(plugin.name.as_str())
        .chain(plugin.description.as_deref())
        .chain(plugin.tags.iter().map(String::as_str))
        .chain(plugin.keywords.iter().map(String::as_str))
        .chain(plugin.category.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::manifest::SourceSpec;

    fn plugin(name: &str, description: &str, tags: &[&str]) -> (String, PluginDescriptor) {
        (
            "acme".to_string(),
            PluginDescriptor {
                name: name.to_string(),
                source: SourceSpec::Path(format!("./{name}")),
                version: None,
                description: Some(description.to_string()),
                keywords: Vec::new(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                category: None,
            },
        )
    }

    #[test]
    fn matches_any_field_best_first() {
        let catalog = vec![
            plugin("linter", "Static analysis", &["quality"]),
            plugin("formatter", "Formats source code", &["style"]),
            plugin("deploy", "Ship to production", &[]),
        ];

        let hits = search("format", catalog.clone());
        assert_eq!(hits[0].plugin.name, "formatter");
        assert!(hits.iter().all(|h| h.plugin.name != "deploy"));

        let hits = search("QUALITY", catalog.clone());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].plugin.name, "linter");

        assert_eq!(search("", catalog).len(), 3);
    }
}
