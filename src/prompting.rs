use minijinja::{context, Environment};

const STORE_ASSISTANT_TEMPLATE: &str = include_str!("prompts/store_assistant.j2");
const BEHAVIOR_ANALYST_TEMPLATE: &str = include_str!("prompts/behavior_analyst.j2");
const BEHAVIOR_ANALYSIS_TEMPLATE: &str = include_str!("prompts/behavior_analysis.j2");

pub struct StoreAssistantContext<'a> {
    pub store_name: &'a str,
    pub store_details: &'a str,
    pub products: &'a str,
    pub support_email: &'a str,
}

pub struct BehaviorAnalysisContext<'a> {
    pub behavior: &'a str,
    pub currency: &'a str,
    pub inactivity_threshold: u32,
    pub scroll_depth_threshold: u32,
    pub min_session_time: u32,
    pub high_intent_cart_value: f64,
}

fn render(name: &str, source: &str, ctx: minijinja::Value) -> Option<String> {
    let mut env = Environment::new();
    env.add_template(name, source).ok()?;
    let template = env.get_template(name).ok()?;
    template.render(ctx).ok()
}

pub fn render_store_assistant_prompt(ctx: &StoreAssistantContext<'_>) -> String {
    let store_name = if ctx.store_name.trim().is_empty() {
        "this store"
    } else {
        ctx.store_name.trim()
    };
    let has_products = !matches!(ctx.products.trim(), "" | "[]");

    render(
        "store_assistant",
        STORE_ASSISTANT_TEMPLATE,
        context! {
            store_name => store_name,
            store_details => ctx.store_details,
            products => ctx.products,
            has_products => has_products,
            support_email => ctx.support_email.trim(),
        },
    )
    .unwrap_or_else(|| {
        format!(
            "You are a knowledgeable shopping assistant for {store_name}.\n\
             Store details: {}\n\
             Available products: {}\n\
             Give accurate, specific answers about {store_name}'s products and services. \
             Never invent products or prices.\n",
            ctx.store_details, ctx.products
        )
    })
}

pub fn render_behavior_analyst_prompt() -> String {
    render("behavior_analyst", BEHAVIOR_ANALYST_TEMPLATE, context! {})
        .unwrap_or_else(|| BEHAVIOR_ANALYST_TEMPLATE.to_string())
}

pub fn render_behavior_analysis_prompt(ctx: &BehaviorAnalysisContext<'_>) -> String {
    render(
        "behavior_analysis",
        BEHAVIOR_ANALYSIS_TEMPLATE,
        context! {
            behavior => ctx.behavior,
            currency => ctx.currency,
            inactivity_threshold => ctx.inactivity_threshold,
            scroll_depth_threshold => ctx.scroll_depth_threshold,
            min_session_time => ctx.min_session_time,
            high_intent_cart_value => ctx.high_intent_cart_value,
        },
    )
    .unwrap_or_else(|| {
        format!(
            "Analyze this visitor behavior data:\n{}\n\n\
             Thresholds: inactivity {}s, scroll depth {}%, minimum session {}s, \
             high intent cart value {} {}.\n\
             Determine if and how we should intervene.",
            ctx.behavior,
            ctx.inactivity_threshold,
            ctx.scroll_depth_threshold,
            ctx.min_session_time,
            ctx.high_intent_cart_value,
            ctx.currency
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_prompt_names_the_store_and_catalog() {
        let prompt = render_store_assistant_prompt(&StoreAssistantContext {
            store_name: "Linen & Co",
            store_details: r#"{"currency":"EUR"}"#,
            products: r#"[{"title":"Linen shirt"}]"#,
            support_email: "help@linen.example",
        });
        assert!(prompt.contains("shopping assistant for Linen & Co"));
        assert!(prompt.contains("Linen shirt"));
        assert!(prompt.contains("help@linen.example"));
    }

    #[test]
    fn store_prompt_warns_when_catalog_is_empty() {
        let prompt = render_store_assistant_prompt(&StoreAssistantContext {
            store_name: "",
            store_details: "{}",
            products: "[]",
            support_email: "",
        });
        assert!(prompt.contains("this store"));
        assert!(prompt.contains("catalog is currently unavailable"));
    }

    #[test]
    fn analysis_prompt_carries_thresholds_as_context() {
        let prompt = render_behavior_analysis_prompt(&BehaviorAnalysisContext {
            behavior: r#"{"scrollDepth":80}"#,
            currency: "USD",
            inactivity_threshold: 30,
            scroll_depth_threshold: 70,
            min_session_time: 10,
            high_intent_cart_value: 50.0,
        });
        assert!(prompt.contains("Inactivity threshold: 30 seconds"));
        assert!(prompt.contains("Scroll depth threshold: 70%"));
        assert!(prompt.contains("High intent cart value: 50.0 USD"));
        assert!(prompt.contains(r#"{"scrollDepth":80}"#));
    }

    #[test]
    fn analyst_prompt_lists_the_decision_schema() {
        let prompt = render_behavior_analyst_prompt();
        assert!(prompt.contains("\"shouldIntervene\": boolean"));
        assert!(prompt.contains("email_collection"));
    }
}
