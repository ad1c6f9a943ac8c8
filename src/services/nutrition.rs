//! 营养信息查询
//!
//! 第三方营养库属于外部协作方，这里只定义边界 trait 与一张内置静态表。
//! 同一个 provider 也以 `lookup_nutrition` 工具的形式提供给 Planner。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::llm::{ToolCall, ToolDefinition, ToolExecutor};

/// 单条营养信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NutritionFact {
    pub food: String,
    pub serving: String,
    pub calories: u32,
    pub protein_g: f32,
    pub highlights: String,
    pub allergens: Vec<String>,
}

impl NutritionFact {
    pub fn describe(&self) -> String {
        format!(
            "{} ({}): {} kcal, {:.0} g protein; {}",
            self.food, self.serving, self.calories, self.protein_g, self.highlights
        )
    }
}

/// 营养信息提供方
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NutritionProvider: Send + Sync {
    /// 返回查询文本中提到的食物的营养信息
    async fn lookup(&self, query: &str) -> Vec<NutritionFact>;
}

/// 内置静态营养表
pub struct StaticNutritionTable {
    entries: Vec<(&'static [&'static str], NutritionFact)>,
}

fn fact(food: &str, serving: &str, calories: u32, protein_g: f32, highlights: &str, allergens: &[&str]) -> NutritionFact {
    NutritionFact {
        food: food.to_string(),
        serving: serving.to_string(),
        calories,
        protein_g,
        highlights: highlights.to_string(),
        allergens: allergens.iter().map(|a| a.to_string()).collect(),
    }
}

fn entry(keys: &'static [&'static str], fact: NutritionFact) -> (&'static [&'static str], NutritionFact) {
    (keys, fact)
}

impl Default for StaticNutritionTable {
    fn default() -> Self {
        let entries: Vec<(&'static [&'static str], NutritionFact)> = vec![
            entry(&["oat", "oatmeal", "porridge"], fact("oats", "1 cup cooked", 150, 5.0, "slow-release carbs and fiber", &["gluten"])),
            entry(&["banana"], fact("banana", "1 medium", 105, 1.3, "quick potassium and carbs", &[])),
            entry(&["spinach"], fact("spinach", "1 cup raw", 7, 0.9, "iron and magnesium", &[])),
            entry(&["salmon"], fact("salmon", "100 g", 208, 20.0, "omega-3 fats", &["fish"])),
            entry(&["egg", "eggs"], fact("eggs", "2 large", 140, 12.0, "complete protein and choline", &["egg"])),
            entry(&["yogurt", "yoghurt"], fact("greek yogurt", "170 g", 100, 17.0, "protein and probiotics", &["dairy"])),
            entry(&["almond", "almonds"], fact("almonds", "28 g", 164, 6.0, "magnesium and vitamin E", &["tree nut"])),
            entry(&["peanut", "peanut butter"], fact("peanut butter", "2 tbsp", 190, 7.0, "protein and healthy fats", &["peanut"])),
            entry(&["lentil", "lentils"], fact("lentils", "1 cup cooked", 230, 18.0, "iron, folate and fiber", &[])),
            entry(&["chicken"], fact("chicken breast", "100 g", 165, 31.0, "lean protein", &[])),
            entry(&["rice"], fact("brown rice", "1 cup cooked", 216, 5.0, "steady energy and B vitamins", &[])),
            entry(&["sweet potato"], fact("sweet potato", "1 medium", 112, 2.0, "complex carbs and vitamin A", &[])),
            entry(&["blueberr"], fact("blueberries", "1 cup", 84, 1.1, "antioxidants", &[])),
            entry(&["tofu"], fact("tofu", "100 g", 144, 15.0, "plant protein and calcium", &["soy"])),
            entry(&["bread", "toast"], fact("whole wheat bread", "1 slice", 80, 4.0, "fiber and B vitamins", &["gluten"])),
            entry(&["milk"], fact("milk", "1 cup", 103, 8.0, "calcium and protein", &["dairy"])),
            entry(&["cheese"], fact("cheese", "28 g", 113, 7.0, "calcium and protein", &["dairy"])),
            entry(&["shrimp", "prawn"], fact("shrimp", "100 g", 99, 24.0, "lean protein and selenium", &["shellfish"])),
            entry(&["walnut", "walnuts"], fact("walnuts", "28 g", 185, 4.3, "omega-3 ALA", &["tree nut"])),
            entry(&["chickpea", "hummus"], fact("chickpeas", "1 cup cooked", 269, 14.5, "fiber and plant protein", &[])),
            entry(&["water"], fact("water", "500 ml", 0, 0.0, "hydration supports energy and focus", &[])),
        ];
        Self { entries }
    }
}

impl StaticNutritionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, query: &str) -> Vec<NutritionFact> {
        let query = query.to_lowercase();
        self.entries
            .iter()
            .filter(|(keys, _)| keys.iter().any(|k| query.contains(k)))
            .map(|(_, fact)| fact.clone())
            .collect()
    }
}

#[async_trait]
impl NutritionProvider for StaticNutritionTable {
    async fn lookup(&self, query: &str) -> Vec<NutritionFact> {
        self.find(query)
    }
}

pub const LOOKUP_TOOL: &str = "lookup_nutrition";

/// 提供给 Planner 的营养查询工具
pub struct NutritionTool {
    provider: Arc<dyn NutritionProvider>,
}

impl NutritionTool {
    pub fn new(provider: Arc<dyn NutritionProvider>) -> Self {
        Self { provider }
    }

    pub fn definition() -> ToolDefinition {
        ToolDefinition::new(
            LOOKUP_TOOL,
            "Look up calories, protein and highlights for a food before recommending it.",
            serde_json::json!({
                "type": "object",
                "properties": { "food": { "type": "string", "description": "Food name" } },
                "required": ["food"]
            }),
        )
    }
}

#[async_trait]
impl ToolExecutor for NutritionTool {
    async fn execute(&self, call: &ToolCall) -> Result<String, String> {
        if call.name != LOOKUP_TOOL {
            return Err(format!("unknown tool: {}", call.name));
        }
        let food = call
            .input
            .get("food")
            .and_then(|v| v.as_str())
            .filter(|f| !f.trim().is_empty())
            .ok_or_else(|| "missing 'food' argument".to_string())?;

        let facts = self.provider.lookup(food).await;
        if facts.is_empty() {
            return Ok(format!("No nutrition data for '{}'.", food));
        }
        serde_json::to_string(&facts).map_err(|e| e.to_string())
    }
}
