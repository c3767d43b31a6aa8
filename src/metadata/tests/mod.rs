mod tests_filters;
