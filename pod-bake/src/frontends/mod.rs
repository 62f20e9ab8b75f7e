mod recipe_file;

pub use recipe_file::{find_recipe_file, RecipeFileFrontend};
