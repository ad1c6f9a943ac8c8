//! Validator：检查计划是否违反用户的过敏与忌口
//!
//! 纯规则校验，不调用模型。每个 (建议项, 约束) 组合最多产生一条冲突。

use regex::Regex;

use crate::models::agent::{Conflict, PlanRecommendation, ValidationVerdict};
use crate::models::profile::UserContext;

/// 过敏原类别：(别名, 涉及的食材, 替代建议)
const ALLERGEN_GROUPS: &[(&[&str], &[&str], &str)] = &[
    (
        &["dairy", "milk", "lactose"],
        &["milk", "cheese", "yogurt", "yoghurt", "cream", "whey", "kefir", "dairy", "latte", "ice cream"],
        "Choose fortified oat or rice drinks",
    ),
    (
        &["peanut"],
        &["peanut", "peanut butter", "satay"],
        "Spread sunflower seed butter instead",
    ),
    (
        &["tree nut", "nut"],
        &["almond", "walnut", "cashew", "pecan", "pistachio", "hazelnut", "macadamia", "nut", "trail mix"],
        "Snack on pumpkin or sunflower seeds",
    ),
    (
        &["shellfish"],
        &["shrimp", "prawn", "crab", "lobster", "shellfish", "clam", "mussel", "oyster", "scallop"],
        "Use chicken or beans for lean protein",
    ),
    (
        &["fish"],
        &["fish", "salmon", "tuna", "cod", "sardine", "mackerel", "trout", "tilapia", "anchovy"],
        "Use chicken, beans or ground flax for protein and omega-3",
    ),
    (
        &["gluten", "wheat"],
        &["wheat", "bread", "toast", "pasta", "barley", "rye", "couscous", "gluten", "cracker", "bagel"],
        "Choose rice, quinoa or potatoes",
    ),
    (
        &["egg"],
        &["egg", "omelet", "omelette", "frittata"],
        "Have a tofu scramble or beans",
    ),
    (
        &["soy"],
        &["soy", "tofu", "edamame", "tempeh", "miso"],
        "Use chickpeas or lentils for plant protein",
    ),
];

struct Constraint {
    label: String,
    terms: Vec<Regex>,
    substitution: String,
}

impl Constraint {
    fn matches(&self, item: &str) -> bool {
        self.terms.iter().any(|re| re.is_match(item))
    }
}

fn term_pattern(term: &str) -> Option<Regex> {
    Regex::new(&format!(r"(?i)\b{}(s|es)?\b", regex::escape(term))).ok()
}

fn normalize(value: &str) -> String {
    let value = value.trim().to_lowercase();
    match value.strip_suffix("s") {
        Some(singular) if !value.ends_with("ss") && singular.len() > 2 => singular.to_string(),
        _ => value,
    }
}

fn allergy(value: &str) -> Constraint {
    let key = normalize(value);
    let group = ALLERGEN_GROUPS
        .iter()
        .find(|(aliases, _, _)| aliases.iter().any(|a| *a == key || normalize(a) == key));

    let (terms, substitution) = match group {
        Some((_, terms, substitution)) => (terms.iter().filter_map(|t| term_pattern(t)).collect(), substitution.to_string()),
        None => (
            term_pattern(&key).into_iter().collect(),
            "Pick an alternative you tolerate well".to_string(),
        ),
    };

    Constraint {
        label: format!("allergy: {}", value.trim()),
        terms,
        substitution,
    }
}

fn dislike(value: &str) -> Constraint {
    let key = normalize(value);
    Constraint {
        label: format!("dislike: {}", value.trim()),
        terms: term_pattern(&key).into_iter().collect(),
        substitution: "Pick something you enjoy instead".to_string(),
    }
}

fn constraints(user: &UserContext) -> Vec<Constraint> {
    user.allergies
        .iter()
        .filter(|a| !a.trim().is_empty())
        .map(|a| allergy(a))
        .chain(user.dislikes.iter().filter(|d| !d.trim().is_empty()).map(|d| dislike(d)))
        .collect()
}

pub struct Validator;

impl Validator {
    pub fn validate(plan: &PlanRecommendation, user: &UserContext) -> ValidationVerdict {
        let constraints = constraints(user);
        let mut conflicts = Vec::new();
        let mut substitutions: Vec<String> = Vec::new();

        for (category, item) in plan.items() {
            for constraint in &constraints {
                if constraint.matches(item) {
                    conflicts.push(Conflict {
                        category: category.to_string(),
                        item: item.clone(),
                        constraint: constraint.label.clone(),
                    });
                    if !substitutions.contains(&constraint.substitution) {
                        substitutions.push(constraint.substitution.clone());
                    }
                }
            }
        }

        ValidationVerdict {
            approved: conflicts.is_empty(),
            conflicts,
            substitutions,
        }
    }

    /// 用替代建议换掉冲突项（降级模式下的重新规划）
    pub fn revise(plan: &PlanRecommendation, user: &UserContext) -> PlanRecommendation {
        let constraints = constraints(user);
        let revise_list = |items: &[String]| -> Vec<String> {
            let mut out: Vec<String> = Vec::new();
            for item in items {
                let replacement = match constraints.iter().find(|c| c.matches(item)) {
                    Some(c) => c.substitution.clone(),
                    None => item.clone(),
                };
                if !out.contains(&replacement) {
                    out.push(replacement);
                }
            }
            out
        };

        PlanRecommendation {
            summary: plan.summary.clone(),
            diet: revise_list(&plan.diet),
            exercise: revise_list(&plan.exercise),
            hydration: revise_list(&plan.hydration),
            recovery: revise_list(&plan.recovery),
            context: plan
                .context
                .iter()
                .filter(|c| !constraints.iter().any(|k| k.matches(c)))
                .cloned()
                .collect(),
        }
    }
}

/// 冲突的文字描述，用作 Planner 的纠正反馈
pub fn describe_conflicts(conflicts: &[Conflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|c| format!("{} item \"{}\" ({})", c.category, c.item, c.constraint))
        .collect()
}
