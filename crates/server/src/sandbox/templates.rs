//! Project type to sandbox template mapping.

/// Template used for project types without a dedicated image.
pub const BASE_TEMPLATE: &str = "sandpit-base";

/// Returns the template tag for a project type.
pub fn template_for(project_type: &str) -> &'static str {
    match project_type {
        "nextjs" => "sandpit-nextjs",
        "streamlit" => "sandpit-streamlit",
        "php" => "sandpit-php",
        "reactjs" => "sandpit-reactjs",
        "vanillajs" => "sandpit-vanillajs",
        _ => BASE_TEMPLATE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_types() {
        assert_eq!(template_for("nextjs"), "sandpit-nextjs");
        assert_eq!(template_for("streamlit"), "sandpit-streamlit");
        assert_eq!(template_for("php"), "sandpit-php");
        assert_eq!(template_for("reactjs"), "sandpit-reactjs");
        assert_eq!(template_for("vanillajs"), "sandpit-vanillajs");
    }

    #[test]
    fn test_unknown_type_uses_base() {
        assert_eq!(template_for("rust"), BASE_TEMPLATE);
        assert_eq!(template_for(""), BASE_TEMPLATE);
        assert_eq!(template_for("NextJS"), BASE_TEMPLATE);
    }
}
