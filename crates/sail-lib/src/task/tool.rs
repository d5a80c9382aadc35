//! Tool inference from command strings.
//!
//! Each leaf task's command is matched against a registry of known
//! executables. The inferred tool decides which files count as inputs,
//! which output locations to expect when nothing is declared, and whether
//! the task can be routed to a reusable worker.

use camino::Utf8Path;

/// Known executables. Anything unrecognized runs as a generic shell task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Tsc,
    Biome,
    Eslint,
    Copyfiles,
    Prettier,
    Webpack,
    ApiExtractor,
    Shell,
}

/// Maps a command's argv[0] (basename) to its tool.
const TOOL_MATCHERS: &[(&str, Tool)] = &[
    ("tsc", Tool::Tsc),
    ("fluid-tsc", Tool::Tsc),
    ("biome", Tool::Biome),
    ("eslint", Tool::Eslint),
    ("copyfiles", Tool::Copyfiles),
    ("prettier", Tool::Prettier),
    ("webpack", Tool::Webpack),
    ("api-extractor", Tool::ApiExtractor),
];

impl Tool {
    pub fn infer(command: &str) -> Tool {
        let Some(argv0) = command.split_whitespace().next() else {
            return Tool::Shell;
        };
        // Commands may invoke tools by path (node_modules/.bin/tsc).
        let basename = argv0.rsplit(['/', '\\']).next().unwrap_or(argv0);
        TOOL_MATCHERS
            .iter()
            .find(|(name, _)| *name == basename)
            .map(|(_, tool)| *tool)
            .unwrap_or(Tool::Shell)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tool::Tsc => "tsc",
            Tool::Biome => "biome",
            Tool::Eslint => "eslint",
            Tool::Copyfiles => "copyfiles",
            Tool::Prettier => "prettier",
            Tool::Webpack => "webpack",
            Tool::ApiExtractor => "api-extractor",
            Tool::Shell => "shell",
        }
    }

    /// Worker tag for tools worth keeping hot. Everything else spawns
    /// per-invocation.
    pub fn worker_name(&self) -> Option<&'static str> {
        match self {
            Tool::Tsc => Some("tsc"),
            Tool::Eslint => Some("eslint"),
            Tool::Biome => Some("biome"),
            _ => None,
        }
    }

    /// Directories (package-relative) this tool writes into by default.
    /// Excluded from input walks and used as fallback output patterns.
    pub fn default_output_globs(&self) -> &'static [&'static str] {
        match self {
            Tool::Tsc => &["dist/**", "lib/**", "*.tsbuildinfo", "**/*.tsbuildinfo"],
            Tool::Webpack | Tool::Copyfiles => &["dist/**"],
            Tool::ApiExtractor => &["api-report/**", "dist/**"],
            // Linters and formatters produce no outputs.
            Tool::Biome | Tool::Eslint | Tool::Prettier | Tool::Shell => &[],
        }
    }

    /// Whether a package-relative file is an input when no input globs are
    /// declared.
    pub fn default_input_filter(&self, rel_path: &Utf8Path) -> bool {
        let name = rel_path.file_name().unwrap_or_default();
        let ext = rel_path.extension().unwrap_or_default();
        match self {
            Tool::Tsc => {
                matches!(ext, "ts" | "tsx" | "mts" | "cts")
                    || (name.starts_with("tsconfig") && ext == "json")
                    || name == "package.json"
            }
            Tool::Eslint => {
                matches!(ext, "ts" | "tsx" | "js" | "jsx" | "mjs" | "cjs")
                    || name.starts_with(".eslintrc")
                    || name.starts_with("eslint.config")
            }
            Tool::Biome => {
                matches!(ext, "ts" | "tsx" | "js" | "jsx" | "json") || name == "biome.json"
            }
            Tool::Prettier => {
                matches!(ext, "ts" | "tsx" | "js" | "jsx" | "json" | "md" | "yml" | "yaml")
                    || name.starts_with(".prettierrc")
            }
            // `extension()` reports "ts" for declaration files too.
            Tool::ApiExtractor => ext == "ts" || name == "api-extractor.json",
            // Copy and shell tasks depend on everything in the package.
            Tool::Copyfiles | Tool::Webpack | Tool::Shell => true,
        }
    }
}
