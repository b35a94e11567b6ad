//! Meal Nutrition Calculator
//!
//! Extracts protein/fat/carbohydrate totals from a free-text meal description
//! by asking the chat model for strict JSON, then validating the reply.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::agent::tools::extract_json_object;
use crate::openai::{ChatMessage, ChatModel};

/// Per-ingredient nutrition breakdown
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngredientNutrition {
    pub ingredient: String,
    pub protein: f64,
    pub fat: f64,
    pub carbohydrate: f64,
}

/// Nutrition totals for one meal
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MealReport {
    pub total_protein: f64,
    pub total_fat: f64,
    pub total_carbohydrate: f64,
    pub calories: f64,
    #[serde(default)]
    pub breakdown: Vec<IngredientNutrition>,
}

impl MealReport {
    /// Render for a chat reply
    pub fn format_reply(&self) -> String {
        let mut out = format!(
            "Protein: {:.1} g\nFat: {:.1} g\nCarbohydrate: {:.1} g\nCalories: {:.0} kcal",
            self.total_protein, self.total_fat, self.total_carbohydrate, self.calories
        );

        if !self.breakdown.is_empty() {
            out.push_str("\n\nBreakdown:");
            for item in &self.breakdown {
                out.push_str(&format!(
                    "\n- {}: P {:.1} / F {:.1} / C {:.1}",
                    item.ingredient, item.protein, item.fat, item.carbohydrate
                ));
            }
        }

        out
    }
}

/// Meal PFC calculator backed by the chat model
pub struct MealCalculator {
    model: Arc<dyn ChatModel>,
}

impl MealCalculator {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Calculate protein/fat/carbohydrate totals for a meal description
    pub async fn calculate(&self, meal_description: &str) -> Result<MealReport> {
        let prompt = format!(
            r#"I had the following meal: "{}".
Please extract the nutritional information from the description and calculate:
- Total proteins in grams,
- Total fats in grams,
- Total carbohydrates in grams,
- Total calories (using 4 kcal/g for proteins and carbohydrates, and 9 kcal/g for fats).

Return the result strictly in the following JSON format:

{{
  "totalProtein": number,
  "totalFat": number,
  "totalCarbohydrate": number,
  "calories": number,
  "breakdown": [
    {{
      "ingredient": string,
      "protein": number,
      "fat": number,
      "carbohydrate": number
    }}
  ]
}}

If ingredient-level details are not available, set "breakdown" to an empty array."#,
            meal_description
        );

        let reply = self.model.chat(&[ChatMessage::user(prompt)]).await?;
        parse_meal_report(reply.text())
    }
}

/// Parse and validate the model's reply into a [`MealReport`]
pub fn parse_meal_report(raw: &str) -> Result<MealReport> {
    let json = extract_json_object(raw)
        .ok_or_else(|| anyhow::anyhow!("meal reply contained no JSON object: {}", raw))?;

    let report: MealReport =
        serde_json::from_str(json).context("failed to parse structured meal output")?;

    let totals = [
        report.total_protein,
        report.total_fat,
        report.total_carbohydrate,
        report.calories,
    ];
    if totals.iter().any(|v| !v.is_finite() || *v < 0.0) {
        anyhow::bail!("meal output contained negative or non-finite totals");
    }

    Ok(report)
}
