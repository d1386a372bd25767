//! Text instructions sent alongside images to the generation models.

use retouch_contracts::instructions::InstructionDirective;

pub const WATERMARK_REMOVAL_PROMPT: &str = "Remove every watermark, logo overlay, caption and \
stamped text from this photo. Reconstruct the covered areas so they blend naturally with the \
surroundings. Do not change anything else: keep the subject, framing, colors and lighting \
identical.";

pub const WATERMARK_DETECTION_PROMPT: &str = "Does this image contain a watermark, logo overlay, \
stamped text or caption that is not part of the photographed scene? Answer with JSON only: \
{\"has_watermark\": true} or {\"has_watermark\": false}.";

pub fn analysis_prompt(image_count: usize) -> String {
    let subject = if image_count > 1 {
        format!("these {image_count} reference photos")
    } else {
        "this reference photo".to_string()
    };
    format!(
        "You are preparing a product photo series. Study {subject} and separate what must stay \
identical across every output from what should change between outputs. Answer with JSON only, \
using this schema:\n\
{{\n  \"consistent_elements\": {{\n    \"synthesized_definition\": {{\n      \
\"subject_summary\": string,\n      \"core_details\": string,\n      \
\"human_features\": string or null,\n      \"scene_atmosphere\": string or null,\n      \
\"visual_quality\": string\n    }}\n  }},\n  \"variable_elements\": [\n    \
{{\"element\": string, \"description\": string}}\n  ]\n}}\n\
Describe one variable element per distinct shot you see."
    )
}

pub fn master_prompt(consistent: &str, variable: &str) -> String {
    let mut sections = vec![
        "Create one high-quality master photo based on the reference images. It defines the \
look every later image in the series must match."
            .to_string(),
    ];
    push_section(&mut sections, "Keep consistent", consistent);
    push_section(&mut sections, "This shot", variable);
    sections.join("\n\n")
}

pub fn modification_prompt(
    consistent: &str,
    variable: &str,
    directive: &InstructionDirective,
) -> String {
    let mut sections = vec![
        "Edit the first image (the current master photo). Apply only the requested change and \
keep everything else exactly as it is. The remaining images are the original references."
            .to_string(),
    ];
    push_section(&mut sections, "Requested change", &directive.text);
    if let Some(strength) = directive.strength {
        sections.push(format!(
            "Change intensity: {:.0}% (0% keeps the photo untouched, 100% applies the change fully).",
            strength * 100.0
        ));
    }
    push_section(&mut sections, "Must stay consistent", consistent);
    push_section(&mut sections, "Shot description", variable);
    sections.join("\n\n")
}

pub fn variant_prompt(
    consistent: &str,
    variable: &str,
    is_regeneration: bool,
    has_reference: bool,
) -> String {
    let mut sections = vec![
        "The first image is the master photo of a series. Create a new photo of the same subject \
that matches the master's identity, materials, colors and quality exactly while following the \
shot description."
            .to_string(),
    ];
    if has_reference {
        sections.push(
            "The last image is a composition reference for this shot: follow its pose, angle and \
framing, not its subject."
                .to_string(),
        );
    }
    if is_regeneration {
        sections.push(
            "This is a retry of a previous attempt: produce a fresh interpretation of the shot."
                .to_string(),
        );
    }
    push_section(&mut sections, "Keep consistent", consistent);
    push_section(&mut sections, "Shot description", variable);
    sections.join("\n\n")
}

fn push_section(sections: &mut Vec<String>, label: &str, body: &str) {
    let body = body.trim();
    if body.is_empty() {
        return;
    }
    sections.push(format!("{label}:\n{body}"));
}
